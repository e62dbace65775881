//! Telemetry types exchanged with the browser extension.
//!
//! Field names follow the extension's JSON wire format, which is mostly
//! snake_case with a handful of camelCase action fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ring_buffer::MemoryEstimate;

/// Fixed per-entry overhead added to WebSocket payload length.
pub const WS_EVENT_OVERHEAD: u64 = 200;
/// Fixed per-entry overhead added to network body lengths.
pub const NETWORK_BODY_OVERHEAD: u64 = 300;
/// Flat estimate for one user action.
pub const ACTION_ESTIMATE: u64 = 500;
/// Fixed per-entry overhead added to extension log message length.
pub const EXTENSION_LOG_OVERHEAD: u64 = 200;

/// Replacement for password input values.
pub const REDACTED_VALUE: &str = "[redacted]";

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Truncate to at most `max` bytes on a char boundary. True if anything was cut.
pub fn truncate_utf8(s: &mut String, max: usize) -> bool {
    if s.len() <= max {
        return false;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    true
}

// =============================================================================
// WebSocket
// =============================================================================

/// A captured WebSocket lifecycle or message event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketEvent {
    /// RFC 3339 timestamp from the page
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ts: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// `open`, `message`, `close` or `error`
    #[serde(default)]
    pub event: String,
    /// Connection identifier
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// `incoming` or `outgoing` for messages
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub direction: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    #[serde(default, rename = "code", skip_serializing_if = "is_zero_u16")]
    pub close_code: u16,
    #[serde(default, rename = "reason", skip_serializing_if = "String::is_empty")]
    pub close_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled: Option<SamplingInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary_format: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub tab_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_ids: Vec<String>,
}

/// Sampling state reported by the extension for high-frequency streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingInfo {
    #[serde(default)]
    pub rate: String,
    #[serde(default)]
    pub logged: String,
    #[serde(default)]
    pub window: String,
}

impl MemoryEstimate for WebSocketEvent {
    fn estimated_bytes(&self) -> u64 {
        self.data.len() as u64 + WS_EVENT_OVERHEAD
    }
}

// =============================================================================
// Network bodies
// =============================================================================

/// A captured HTTP request/response pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkBody {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ts: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub request_truncated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub response_truncated: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_auth_header: bool,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub tab_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_ids: Vec<String>,
}

impl NetworkBody {
    /// Status codes >= 400 count as errors.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

impl MemoryEstimate for NetworkBody {
    fn estimated_bytes(&self) -> u64 {
        self.request_body.len() as u64 + self.response_body.len() as u64 + NETWORK_BODY_OVERHEAD
    }
}

// =============================================================================
// User actions
// =============================================================================

/// A user interaction with multi-strategy selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAction {
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, rename = "inputType", skip_serializing_if = "String::is_empty")]
    pub input_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, rename = "fromUrl", skip_serializing_if = "String::is_empty")]
    pub from_url: String,
    #[serde(default, rename = "toUrl", skip_serializing_if = "String::is_empty")]
    pub to_url: String,
    #[serde(default, rename = "selectedValue", skip_serializing_if = "String::is_empty")]
    pub selected_value: String,
    #[serde(default, rename = "selectedText", skip_serializing_if = "String::is_empty")]
    pub selected_text: String,
    #[serde(default, rename = "scrollY", skip_serializing_if = "is_zero_i64")]
    pub scroll_y: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub tab_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_ids: Vec<String>,
}

impl EnhancedAction {
    /// Replace the typed value of password inputs.
    pub fn redact(&mut self) {
        if self.input_type == "password" && !self.value.is_empty() {
            self.value = REDACTED_VALUE.to_string();
        }
    }
}

impl MemoryEstimate for EnhancedAction {
    fn estimated_bytes(&self) -> u64 {
        ACTION_ESTIMATE
    }
}

// =============================================================================
// Extension logs
// =============================================================================

/// Internal diagnostic log line emitted by the extension itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl MemoryEstimate for ExtensionLog {
    fn estimated_bytes(&self) -> u64 {
        self.message.len() as u64 + EXTENSION_LOG_OVERHEAD
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Read filter for WebSocket events. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketEventFilter {
    pub connection_id: Option<String>,
    /// Substring match on the connection URL
    pub url: Option<String>,
    pub direction: Option<String>,
    pub test_id: Option<String>,
    pub limit: Option<usize>,
}

impl WebSocketEventFilter {
    #[must_use]
    pub fn matches(&self, event: &WebSocketEvent) -> bool {
        if let Some(id) = non_empty(self.connection_id.as_deref()) {
            if event.id != id {
                return false;
            }
        }
        if let Some(url) = non_empty(self.url.as_deref()) {
            if !event.url.contains(url) {
                return false;
            }
        }
        if let Some(direction) = non_empty(self.direction.as_deref()) {
            if event.direction != direction {
                return false;
            }
        }
        if let Some(test_id) = non_empty(self.test_id.as_deref()) {
            if !event.test_ids.iter().any(|t| t == test_id) {
                return false;
            }
        }
        true
    }
}

/// Read filter for network bodies. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkBodyFilter {
    /// Substring match on the request URL
    pub url: Option<String>,
    /// Case-insensitive method match
    pub method: Option<String>,
    pub status_min: Option<u16>,
    pub status_max: Option<u16>,
    pub test_id: Option<String>,
    pub limit: Option<usize>,
}

impl NetworkBodyFilter {
    #[must_use]
    pub fn matches(&self, body: &NetworkBody) -> bool {
        if let Some(url) = non_empty(self.url.as_deref()) {
            if !body.url.contains(url) {
                return false;
            }
        }
        if let Some(method) = non_empty(self.method.as_deref()) {
            if !body.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(min) = self.status_min.filter(|m| *m > 0) {
            if body.status < min {
                return false;
            }
        }
        if let Some(max) = self.status_max.filter(|m| *m > 0) {
            if body.status > max {
                return false;
            }
        }
        if let Some(test_id) = non_empty(self.test_id.as_deref()) {
            if !body.test_ids.iter().any(|t| t == test_id) {
                return false;
            }
        }
        true
    }
}

/// Read filter for user actions. Results are oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancedActionFilter {
    /// Keep only the newest N matches
    pub last_n: Option<usize>,
    /// Substring match on the page URL
    pub url: Option<String>,
    pub test_id: Option<String>,
}

impl EnhancedActionFilter {
    #[must_use]
    pub fn matches(&self, action: &EnhancedAction) -> bool {
        if let Some(url) = non_empty(self.url.as_deref()) {
            if !action.url.contains(url) {
                return false;
            }
        }
        if let Some(test_id) = non_empty(self.test_id.as_deref()) {
            if !action.test_ids.iter().any(|t| t == test_id) {
                return false;
            }
        }
        true
    }
}

/// Filter for the connection status view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketStatusFilter {
    pub url: Option<String>,
    pub connection_id: Option<String>,
}

impl WebSocketStatusFilter {
    #[must_use]
    pub fn matches(&self, id: &str, url: &str) -> bool {
        if let Some(filter_url) = non_empty(self.url.as_deref()) {
            if !url.contains(filter_url) {
                return false;
            }
        }
        if let Some(filter_id) = non_empty(self.connection_id.as_deref()) {
            if id != filter_id {
                return false;
            }
        }
        true
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}

// =============================================================================
// Lifecycle events
// =============================================================================

/// State transitions reported to the embedding server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    CircuitOpened {
        reason: String,
        streak: u32,
        rate: u64,
        threshold: u64,
    },
    CircuitClosed {
        previous_reason: String,
        open_duration_secs: f64,
        rate: u64,
    },
    ExtensionConnected {
        session_id: String,
        is_reconnect: bool,
        disconnect_seconds: f64,
    },
    ExtensionDisconnected {
        session_id: String,
        client_id: String,
    },
    BufferEviction {
        tier: String,
        evicted_entries: u64,
        memory_before: u64,
        memory_after: u64,
    },
}

impl LifecycleEvent {
    /// Event name as used on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::ExtensionConnected { .. } => "extension_connected",
            Self::ExtensionDisconnected { .. } => "extension_disconnected",
            Self::BufferEviction { .. } => "buffer_eviction",
        }
    }
}

/// Callback invoked for every lifecycle event. Never called under a lock.
pub type LifecycleCallback = std::sync::Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

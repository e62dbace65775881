//! Browser extension liveness, settings and test-boundary state.
//!
//! Lives under the capture lock: the active test IDs are read on every
//! ingest, so they share a lock domain with the buffers they tag.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::rfc3339;

/// A poll gap longer than this counts as a reconnect.
pub const RECONNECT_GAP: Duration = Duration::from_secs(3);

/// Settings the extension reports on each sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub pilot_enabled: bool,
    pub tracking_enabled: bool,
    pub tracked_tab_id: i64,
    pub tracked_tab_url: String,
    pub tracked_tab_title: String,
    pub capture_logs: bool,
    pub capture_network: bool,
    pub capture_websocket: bool,
    pub capture_actions: bool,
}

/// `{ connected, last_seen, client_id }` for status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStatus {
    pub connected: bool,
    /// RFC 3339, empty if never synced
    pub last_seen: String,
    pub client_id: String,
}

/// Single-tab tracking as last reported by the extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub enabled: bool,
    pub tab_id: i64,
    pub tab_url: String,
    pub tab_title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub extension_version: String,
    pub server_version: String,
    pub mismatch: bool,
}

/// What a sync changed, captured under the lock for the caller to act on.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTransition {
    /// No sync had been seen before this one.
    pub first_connect: bool,
    /// The previous poll was more than [`RECONNECT_GAP`] ago.
    pub is_reconnect: bool,
    /// The previous sync was older than the disconnect threshold.
    pub was_disconnected: bool,
    pub since_last_poll: Duration,
    pub session_id: String,
    pub pilot_enabled: bool,
}

#[derive(Debug, Default)]
pub struct ExtensionState {
    last_sync_seen: Option<Instant>,
    last_sync_wall: Option<DateTime<Utc>>,
    last_poll_at: Option<Instant>,
    last_sync_client_id: String,
    extension_session: String,
    session_changed_at: Option<DateTime<Utc>>,
    extension_version: String,
    pilot_enabled: bool,
    tracking: TrackingStatus,
    active_test_ids: BTreeSet<String>,
}

impl ExtensionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sync from `client_id` and apply any reported settings.
    pub fn record_sync(
        &mut self,
        session_id: &str,
        settings: Option<&SyncSettings>,
        client_id: &str,
        now: Instant,
        wall: DateTime<Utc>,
        disconnect_threshold: Duration,
    ) -> SyncTransition {
        let since_last_poll = self
            .last_poll_at
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
        let first_connect = self.last_poll_at.is_none();
        let is_reconnect = self.last_poll_at.is_some() && since_last_poll > RECONNECT_GAP;
        let was_disconnected = self
            .last_sync_seen
            .is_some_and(|at| now.saturating_duration_since(at) >= disconnect_threshold);

        self.last_poll_at = Some(now);
        self.last_sync_seen = Some(now);
        self.last_sync_wall = Some(wall);
        self.last_sync_client_id = client_id.to_string();

        if !session_id.is_empty() && session_id != self.extension_session {
            self.extension_session = session_id.to_string();
            self.session_changed_at = Some(wall);
        }
        if let Some(settings) = settings {
            self.pilot_enabled = settings.pilot_enabled;
            self.tracking = TrackingStatus {
                enabled: settings.tracking_enabled,
                tab_id: settings.tracked_tab_id,
                tab_url: settings.tracked_tab_url.clone(),
                tab_title: settings.tracked_tab_title.clone(),
            };
        }

        SyncTransition {
            first_connect,
            is_reconnect,
            was_disconnected,
            since_last_poll,
            session_id: self.extension_session.clone(),
            pilot_enabled: self.pilot_enabled,
        }
    }

    /// Synced within `threshold`. Never-synced reads as not connected.
    #[must_use]
    pub fn is_connected(&self, now: Instant, threshold: Duration) -> bool {
        self.last_sync_seen
            .is_some_and(|at| now.saturating_duration_since(at) < threshold)
    }

    /// Synced before, but not within `threshold`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.last_sync_seen
            .is_some_and(|at| now.saturating_duration_since(at) >= threshold)
    }

    #[must_use]
    pub fn status(&self, now: Instant, threshold: Duration) -> ExtensionStatus {
        ExtensionStatus {
            connected: self.is_connected(now, threshold),
            last_seen: self.last_seen(),
            client_id: self.last_sync_client_id.clone(),
        }
    }

    #[must_use]
    pub fn last_seen(&self) -> String {
        self.last_sync_wall.map(rfc3339).unwrap_or_default()
    }

    pub fn set_extension_version(&mut self, version: &str) {
        if !version.is_empty() {
            self.extension_version = version.to_string();
        }
    }

    #[must_use]
    pub fn extension_version(&self) -> &str {
        &self.extension_version
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.extension_session
    }

    #[must_use]
    pub fn session_changed_at(&self) -> Option<DateTime<Utc>> {
        self.session_changed_at
    }

    #[must_use]
    pub fn pilot_enabled(&self) -> bool {
        self.pilot_enabled
    }

    #[must_use]
    pub fn tracking(&self) -> &TrackingStatus {
        &self.tracking
    }

    // -------------------------------------------------------------------------
    // Test boundaries
    // -------------------------------------------------------------------------

    pub fn start_test(&mut self, id: &str) {
        self.active_test_ids.insert(id.to_string());
    }

    pub fn end_test(&mut self, id: &str) {
        self.active_test_ids.remove(id);
    }

    /// Sorted copy of the active test IDs.
    #[must_use]
    pub fn active_test_ids(&self) -> Vec<String> {
        self.active_test_ids.iter().cloned().collect()
    }

    #[must_use]
    pub fn active_test_id_count(&self) -> usize {
        self.active_test_ids.len()
    }
}

/// `"X.Y"` from `"X.Y.Z"` (or `"X.Y"` itself). None without a dot.
#[must_use]
pub fn major_minor(version: &str) -> Option<&str> {
    let mut dots = version.match_indices('.').map(|(i, _)| i);
    dots.next()?;
    match dots.next() {
        Some(second) => Some(&version[..second]),
        None => Some(version),
    }
}

/// Mismatch only when both versions are present and parse.
#[must_use]
pub fn version_mismatch(extension: &str, server: &str) -> bool {
    if extension.is_empty() || server.is_empty() {
        return false;
    }
    match (major_minor(extension), major_minor(server)) {
        (Some(ext), Some(srv)) => ext != srv,
        _ => false,
    }
}

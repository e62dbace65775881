//! Point-in-time health view of the bridge.

use serde::{Deserialize, Serialize};

use crate::memory_pressure::MemoryStatus;

/// Everything a status endpoint reports, gathered in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    // Buffers
    pub websocket_count: usize,
    pub network_body_count: usize,
    pub action_count: usize,
    pub extension_log_count: usize,
    /// Active WebSocket connections
    pub connection_count: usize,

    // Circuit
    pub circuit_open: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub circuit_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_opened_at: Option<String>,
    pub window_event_count: u64,
    pub memory_bytes: u64,

    // Queries and commands
    pub pending_query_count: usize,
    pub query_result_count: usize,
    pub pending_commands: usize,
    pub completed_commands: usize,
    pub failed_commands: usize,

    // Extension
    pub extension_connected: bool,
    /// RFC 3339, empty if never synced
    pub extension_last_seen: String,
    pub active_test_id_count: usize,
    pub query_timeout_ms: u64,
    pub minimal_mode: bool,

    pub memory: MemoryStatus,
}

impl HealthSnapshot {
    /// Ingestion is degraded while the circuit is open or minimal mode is on.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.circuit_open || self.minimal_mode
    }
}

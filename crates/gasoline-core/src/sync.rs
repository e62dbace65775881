//! Extension sync handshake.
//!
//! One request carries everything the extension has for the server
//! (settings, logs, command results, an ack); the response carries every
//! pending command. With nothing to deliver the server long-polls for up to
//! [`LONG_POLL`] before answering.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capture::Capture;
use crate::clock::rfc3339;
use crate::commands::DISCONNECTED_REASON;
use crate::query_dispatcher::PendingQueryResponse;
use crate::types::{ExtensionLog, LifecycleEvent};

pub use crate::extension_state::SyncSettings;

/// Longest a sync waits for a command to show up.
pub const LONG_POLL: Duration = Duration::from_secs(5);
/// Poll hint when commands were delivered.
pub const NEXT_POLL_ACTIVE_MS: u64 = 200;
/// Poll hint when the queue was empty.
pub const NEXT_POLL_IDLE_MS: u64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    pub session_id: String,
    pub extension_version: String,
    pub settings: Option<SyncSettings>,
    pub extension_logs: Vec<ExtensionLog>,
    /// ID of the last command the extension picked up
    pub last_command_ack: String,
    pub command_results: Vec<SyncCommandResult>,
}

/// Result of one command, as posted back by the extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCommandResult {
    /// Query ID; may be empty when only the correlation ID is known
    pub id: String,
    pub correlation_id: String,
    pub status: String,
    pub result: Option<Value>,
    pub error: String,
}

/// A command delivered to the extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tab_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl From<PendingQueryResponse> for SyncCommand {
    fn from(q: PendingQueryResponse) -> Self {
        Self {
            id: q.id,
            kind: q.kind,
            params: q.params,
            tab_id: q.tab_id,
            correlation_id: q.correlation_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub ack: bool,
    pub commands: Vec<SyncCommand>,
    pub next_poll_ms: u64,
    /// RFC 3339
    pub server_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_version: String,
    /// Per-capture setting overrides pushed to the extension
    #[serde(default)]
    pub capture_overrides: BTreeMap<String, String>,
}

impl Capture {
    /// Process one sync from `client_id` and answer with pending commands.
    pub async fn handle_sync(&self, req: SyncRequest, client_id: &str) -> SyncResponse {
        let server_time = rfc3339(self.clock().wall());
        let transition = self.record_sync(&req.session_id, req.settings.as_ref(), client_id);

        if transition.first_connect || transition.is_reconnect {
            let disconnect_seconds = transition.since_last_poll.as_secs_f64();
            info!(
                session_id = %transition.session_id,
                is_reconnect = transition.is_reconnect,
                disconnect_seconds,
                "Extension connected"
            );
            self.emit(LifecycleEvent::ExtensionConnected {
                session_id: transition.session_id.clone(),
                is_reconnect: transition.is_reconnect,
                disconnect_seconds,
            });
        }

        self.apply_command_results(&req.command_results, client_id);
        self.queries().acknowledge_pending_query(&req.last_command_ack);

        if transition.was_disconnected {
            let expired = self.queries().expire_all_pending_queries(DISCONNECTED_REASON);
            warn!(
                session_id = %transition.session_id,
                client_id,
                expired,
                "Extension returned after disconnect"
            );
            self.emit(LifecycleEvent::ExtensionDisconnected {
                session_id: transition.session_id.clone(),
                client_id: client_id.to_string(),
            });
        }

        let mut pending = self.queries().get_pending_queries();
        if pending.is_empty() {
            self.queries().wait_for_pending_queries(LONG_POLL).await;
            pending = self.queries().get_pending_queries();
        }

        self.add_extension_logs(req.extension_logs);
        self.set_extension_version(&req.extension_version);

        let next_poll_ms = if pending.is_empty() {
            NEXT_POLL_IDLE_MS
        } else {
            NEXT_POLL_ACTIVE_MS
        };
        debug!(
            client_id,
            commands = pending.len(),
            next_poll_ms,
            "Sync answered"
        );
        SyncResponse {
            ack: true,
            commands: pending.into_iter().map(SyncCommand::from).collect(),
            next_poll_ms,
            server_time,
            server_version: self.server_version(),
            capture_overrides: BTreeMap::new(),
        }
    }

    /// Store query results and complete the commands they belong to.
    fn apply_command_results(&self, results: &[SyncCommandResult], client_id: &str) {
        if results.is_empty() {
            return;
        }
        let _span = crate::bridge_span!("command_results", client_id = client_id, count = results.len()).entered();
        for res in results {
            let mut correlation_id = res.correlation_id.clone();
            if !res.id.is_empty() {
                let value = res.result.clone().unwrap_or(Value::Null);
                let mapped = self.queries().set_query_result_only(&res.id, value, client_id);
                if correlation_id.is_empty() {
                    correlation_id = mapped.unwrap_or_default();
                }
            }
            if correlation_id.is_empty() {
                debug!(query_id = %res.id, "Command result without correlation ID");
                continue;
            }
            self.queries().complete_command_with_status(
                &correlation_id,
                res.result.clone(),
                &res.status,
                &res.error,
            );
        }
    }
}

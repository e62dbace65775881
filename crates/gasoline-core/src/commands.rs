//! Async command records and status vocabulary.
//!
//! A command is keyed by a caller-chosen correlation ID. It starts `pending`
//! and moves exactly once to a terminal status; later writes are ignored.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error text for commands whose deadline passed without a result.
pub const EXPIRED_REASON: &str = "Command expired before extension could execute it";

/// Error text for commands dropped from a full query queue.
pub const OVERFLOW_REASON: &str =
    "Query queue overflow: command was dropped to make room for newer commands";

/// Error text for commands expired because the browser client went away.
pub const DISCONNECTED_REASON: &str = "extension_disconnected";

// =============================================================================
// CommandStatus
// =============================================================================

/// Lifecycle status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Complete,
    Error,
    Timeout,
    Expired,
    Cancelled,
}

impl CommandStatus {
    /// Map a client-reported status string onto the closed vocabulary.
    ///
    /// Unknown values are treated as success.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "ok" | "success" | "succeeded" | "done" | "complete" => Self::Complete,
            "pending" | "queued" | "running" | "still_processing" => Self::Pending,
            "error" => Self::Error,
            "timeout" => Self::Timeout,
            "expired" => Self::Expired,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Complete,
        }
    }

    /// Statuses that land in the failed-command history.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Error | Self::Timeout | Self::Expired | Self::Cancelled
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::normalize(s))
    }
}

// =============================================================================
// CommandResult
// =============================================================================

/// Snapshot of one tracked command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub correlation_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Owning client; empty means visible to every caller.
    #[serde(skip)]
    pub client_id: String,
}

impl CommandResult {
    #[must_use]
    pub fn pending(
        correlation_id: impl Into<String>,
        client_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: CommandStatus::Pending,
            result: None,
            error: String::new(),
            created_at,
            completed_at: None,
            client_id: client_id.into(),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == CommandStatus::Pending
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status.is_failure()
    }

    /// Whether `client` may observe this command.
    #[must_use]
    pub fn visible_to(&self, client: &str) -> bool {
        client.is_empty() || self.client_id.is_empty() || self.client_id == client
    }
}

/// Active-table entry: the public record plus its local deadline.
#[derive(Debug, Clone)]
pub(crate) struct TrackedCommand {
    pub(crate) record: CommandResult,
    pub(crate) registered_at: Instant,
    pub(crate) deadline: Option<Instant>,
}

/// Counts by bucket, for health output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

// =============================================================================
// FailedHistory
// =============================================================================

/// Bounded FIFO of commands that ended in a failure status.
#[derive(Debug, Clone)]
pub(crate) struct FailedHistory {
    entries: VecDeque<CommandResult>,
    capacity: usize,
}

impl FailedHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(128)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, record: CommandResult) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub(crate) fn find(&self, correlation_id: &str) -> Option<&CommandResult> {
        self.entries
            .iter()
            .rev()
            .find(|c| c.correlation_id == correlation_id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &CommandResult> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

//! Recording boundary.
//!
//! Capture forwards user actions to a [`RecordingSink`] while a recording is
//! active. Persistence belongs to the sink; the core only carries the
//! lifecycle calls and an in-memory sink used by tests and embedders that do
//! not need files.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::EnhancedAction;

/// Returned when a recording stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub id: String,
    pub action_count: usize,
    pub duration_ms: i64,
}

/// Where recorded actions go.
pub trait RecordingSink: Send + Sync {
    /// Begin a recording and return its ID.
    fn start(&self, name: &str, url: &str) -> Result<String>;

    /// Finish `id` and persist it.
    fn stop(&self, id: &str) -> Result<RecordingSummary>;

    /// Append one (already redacted) action to the active recording.
    fn add_action(&self, action: &EnhancedAction) -> Result<()>;

    /// Bytes used by stored recordings.
    fn storage_used(&self) -> Result<u64>;
}

/// Recording ID: `<name>-YYYYMMDDTHHMMSS-<nanos>Z`, or `recording-...` unnamed.
#[must_use]
pub fn recording_id(name: &str, at: DateTime<Utc>) -> String {
    let stamp = format!(
        "{}-{:09}Z",
        at.format("%Y%m%dT%H%M%S"),
        at.timestamp_subsec_nanos()
    );
    if name.is_empty() {
        format!("recording-{stamp}")
    } else {
        format!("{name}-{stamp}")
    }
}

// =============================================================================
// In-memory sink
// =============================================================================

#[derive(Debug)]
struct StoredRecording {
    started_at: DateTime<Utc>,
    actions: Vec<EnhancedAction>,
    bytes: u64,
}

#[derive(Debug, Default)]
struct SinkState {
    active: Option<String>,
    recordings: HashMap<String, StoredRecording>,
    stored_bytes: u64,
}

/// Keeps recordings in process memory. Storage usage is the JSON size of
/// stopped recordings.
#[derive(Debug, Default)]
pub struct InMemoryRecordingSink {
    state: Mutex<SinkState>,
}

impl InMemoryRecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Actions captured for `id`, if it exists.
    #[must_use]
    pub fn actions(&self, id: &str) -> Option<Vec<EnhancedAction>> {
        self.lock().recordings.get(id).map(|r| r.actions.clone())
    }
}

impl RecordingSink for InMemoryRecordingSink {
    fn start(&self, name: &str, _url: &str) -> Result<String> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            return Err(Error::Recording(format!(
                "already_recording: a recording is already active (id: {active})"
            )));
        }
        let now = Utc::now();
        let id = recording_id(name, now);
        state.recordings.insert(
            id.clone(),
            StoredRecording {
                started_at: now,
                actions: Vec::new(),
                bytes: 0,
            },
        );
        state.active = Some(id.clone());
        Ok(id)
    }

    fn stop(&self, id: &str) -> Result<RecordingSummary> {
        let mut state = self.lock();
        let Some(recording) = state.recordings.get_mut(id) else {
            return Err(Error::Recording(format!(
                "recording_not_found: no recording with id: {id}"
            )));
        };
        let bytes = serde_json::to_vec(&recording.actions)?.len() as u64;
        recording.bytes = bytes;
        let summary = RecordingSummary {
            id: id.to_string(),
            action_count: recording.actions.len(),
            duration_ms: (Utc::now() - recording.started_at).num_milliseconds(),
        };
        state.stored_bytes += bytes;
        if state.active.as_deref() == Some(id) {
            state.active = None;
        }
        Ok(summary)
    }

    fn add_action(&self, action: &EnhancedAction) -> Result<()> {
        let mut state = self.lock();
        let Some(active) = state.active.clone() else {
            return Err(Error::Recording("not_recording: no active recording".to_string()));
        };
        match state.recordings.get_mut(&active) {
            Some(recording) => {
                recording.actions.push(action.clone());
                Ok(())
            }
            None => Err(Error::Recording(
                "recording_missing: active recording not found".to_string(),
            )),
        }
    }

    fn storage_used(&self) -> Result<u64> {
        Ok(self.lock().stored_bytes)
    }
}

//! Composition root for the bridge.
//!
//! [`Capture`] owns the four telemetry buffers, the connection tracker, the
//! memory enforcer and extension state behind one lock, plus the circuit
//! breaker and query dispatcher, which keep their own locks so command
//! bookkeeping never waits on ingestion.
//!
//! ```text
//! producer ─▶ admit() ─▶ add_*() ─▶ RingBuffer ─▶ MemoryEnforcer
//!                                     │               │
//!                          ConnectionTracker   CircuitBreaker (memory signal)
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{SharedClock, system_clock};
use crate::commands::DISCONNECTED_REASON;
use crate::config::BridgeConfig;
use crate::connection_tracker::{ConnectionTracker, WebSocketStatusResponse};
use crate::error::{AdmissionError, Error, Result};
use crate::extension_state::{
    ExtensionState, ExtensionStatus, SyncSettings, SyncTransition, TrackingStatus, VersionInfo,
    version_mismatch,
};
use crate::health::HealthSnapshot;
use crate::memory_pressure::{EvictionOutcome, MemoryEnforcer, MemoryStatus, PressuredBuffers};
use crate::query_dispatcher::{PendingQueryResponse, QueryDispatcher};
use crate::recording::{RecordingSink, RecordingSummary};
use crate::ring_buffer::{MemoryEstimate, RingBuffer};
use crate::types::{
    EnhancedAction, EnhancedActionFilter, ExtensionLog, LifecycleCallback, LifecycleEvent,
    NetworkBody, NetworkBodyFilter, WebSocketEvent, WebSocketEventFilter, WebSocketStatusFilter,
    truncate_utf8,
};

// =============================================================================
// Snapshot
// =============================================================================

/// Counts and monotonic totals per buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CaptureSnapshot {
    pub websocket_count: usize,
    pub websocket_total_added: u64,
    pub network_count: usize,
    pub network_total_added: u64,
    pub network_error_total_added: u64,
    pub action_count: usize,
    pub action_total_added: u64,
    pub extension_log_count: usize,
    pub extension_log_total_added: u64,
}

// =============================================================================
// State
// =============================================================================

struct CaptureState {
    websocket: RingBuffer<WebSocketEvent>,
    network: RingBuffer<NetworkBody>,
    actions: RingBuffer<EnhancedAction>,
    logs: RingBuffer<ExtensionLog>,
    connections: ConnectionTracker,
    memory: MemoryEnforcer,
    extension: ExtensionState,
    network_errors_added: u64,
    server_version: String,
}

impl CaptureState {
    fn new(config: &BridgeConfig, clock: SharedClock) -> Self {
        let b = &config.buffers;
        Self {
            websocket: RingBuffer::new(b.max_ws_events.max(1), Some(b.ws_memory_limit)),
            network: RingBuffer::new(b.max_network_bodies.max(1), Some(b.network_memory_limit)),
            actions: RingBuffer::new(b.max_enhanced_actions.max(1), None),
            logs: RingBuffer::new(b.max_extension_logs.max(1), None),
            connections: ConnectionTracker::new(config.connections.clone(), clock),
            memory: MemoryEnforcer::new(config.memory.clone()),
            extension: ExtensionState::new(),
            network_errors_added: 0,
            server_version: String::new(),
        }
    }

    fn total_memory(&self) -> u64 {
        self.websocket
            .memory_total()
            .saturating_add(self.network.memory_total())
            .saturating_add(self.actions.memory_total())
    }

    fn enforce_memory(&mut self, now: Instant) -> Option<EvictionOutcome> {
        let Self {
            network,
            websocket,
            actions,
            memory,
            ..
        } = self;
        memory.enforce(
            PressuredBuffers {
                network,
                websocket,
                actions,
            },
            now,
        )
    }

    fn memory_status(&mut self) -> MemoryStatus {
        let Self {
            network,
            websocket,
            actions,
            memory,
            ..
        } = self;
        memory.status(&PressuredBuffers {
            network,
            websocket,
            actions,
        })
    }
}

#[derive(Default)]
struct RecorderState {
    sink: Option<Arc<dyn RecordingSink>>,
    active: Option<String>,
}

// =============================================================================
// Capture
// =============================================================================

/// Shared bridge state. Wrap in an `Arc` and hand to every handler.
pub struct Capture {
    config: BridgeConfig,
    clock: SharedClock,
    state: Mutex<CaptureState>,
    breaker: CircuitBreaker,
    queries: Arc<QueryDispatcher>,
    callback: Mutex<Option<LifecycleCallback>>,
    recorder: Mutex<RecorderState>,
}

impl Capture {
    /// Build with the system clock.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    #[must_use]
    pub fn with_clock(config: BridgeConfig, clock: SharedClock) -> Self {
        let state = CaptureState::new(&config, Arc::clone(&clock));
        let breaker = CircuitBreaker::new(config.circuit.clone(), Arc::clone(&clock));
        let queries = Arc::new(QueryDispatcher::new(config.queries.clone(), Arc::clone(&clock)));
        Self {
            config,
            clock,
            state: Mutex::new(state),
            breaker,
            queries,
            callback: Mutex::new(None),
            recorder: Mutex::new(RecorderState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CaptureState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_recorder(&self) -> MutexGuard<'_, RecorderState> {
        match self.recorder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Command and query broker.
    #[must_use]
    pub fn queries(&self) -> &Arc<QueryDispatcher> {
        &self.queries
    }

    // -------------------------------------------------------------------------
    // Lifecycle events
    // -------------------------------------------------------------------------

    /// Install (or clear) the lifecycle callback for every component.
    pub fn set_lifecycle_callback(&self, callback: Option<LifecycleCallback>) {
        self.breaker.set_lifecycle_callback(callback.clone());
        let mut slot = match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = callback;
    }

    /// Invoke the callback. Must not be called with any lock held.
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let callback = match self.callback.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Gate a batch of `n` events: reject, or count them and recheck.
    pub fn admit(&self, n: u64) -> std::result::Result<(), AdmissionError> {
        self.breaker.admission()?;
        self.breaker.record_events(n);
        self.breaker.admission()
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    pub fn add_websocket_events(&self, events: Vec<WebSocketEvent>) {
        if events.is_empty() {
            return;
        }
        let _span = crate::bridge_span!("ingest", buffer = "websocket", count = events.len()).entered();
        let now = self.clock.now();
        let mut state = self.lock_state();
        let test_ids = state.extension.active_test_ids();
        let mut tagged = Vec::with_capacity(events.len());
        for mut event in events {
            event.test_ids.clone_from(&test_ids);
            state.connections.track(&event);
            tagged.push(event);
        }
        let evicted = state.websocket.add(tagged, now);
        if evicted > 0 {
            debug!(buffer = "websocket", evicted, "Buffer eviction");
        }
        self.finish_ingest(state, now);
    }

    pub fn add_network_bodies(&self, bodies: Vec<NetworkBody>) {
        if bodies.is_empty() {
            return;
        }
        let _span = crate::bridge_span!("ingest", buffer = "network", count = bodies.len()).entered();
        let now = self.clock.now();
        let limits = &self.config.buffers;
        let mut state = self.lock_state();
        let test_ids = state.extension.active_test_ids();
        let mut errors = 0u64;
        let bodies: Vec<NetworkBody> = bodies
            .into_iter()
            .map(|mut body| {
                if truncate_utf8(&mut body.request_body, limits.max_request_body) {
                    body.request_truncated = true;
                }
                if truncate_utf8(&mut body.response_body, limits.max_response_body) {
                    body.response_truncated = true;
                }
                if body.is_error() {
                    errors += 1;
                }
                body.test_ids.clone_from(&test_ids);
                body
            })
            .collect();
        state.network_errors_added += errors;
        let evicted = state.network.add(bodies, now);
        if evicted > 0 {
            debug!(buffer = "network", evicted, "Buffer eviction");
        }
        self.finish_ingest(state, now);
    }

    /// Buffer actions (password values redacted) and forward them to an
    /// active recording.
    pub fn add_enhanced_actions(&self, actions: Vec<EnhancedAction>) {
        if actions.is_empty() {
            return;
        }
        let now = self.clock.now();
        let mut state = self.lock_state();
        let test_ids = state.extension.active_test_ids();
        let actions: Vec<EnhancedAction> = actions
            .into_iter()
            .map(|mut action| {
                action.redact();
                action.test_ids.clone_from(&test_ids);
                action
            })
            .collect();
        let forwarded = actions.clone();
        state.actions.add(actions, now);
        self.finish_ingest(state, now);
        self.forward_to_recording(&forwarded);
    }

    /// Buffer extension logs, stamping missing timestamps.
    pub fn add_extension_logs(&self, logs: Vec<ExtensionLog>) {
        if logs.is_empty() {
            return;
        }
        let now = self.clock.now();
        let wall = self.clock.wall();
        let logs = logs.into_iter().map(|mut log| {
            log.timestamp.get_or_insert(wall);
            log
        });
        self.lock_state().logs.add(logs, now);
    }

    /// Enforce memory, publish the new total to the breaker, then report any
    /// eviction once the lock is gone.
    fn finish_ingest(&self, mut state: MutexGuard<'_, CaptureState>, now: Instant) {
        let outcome = state.enforce_memory(now);
        let memory = state.total_memory();
        drop(state);
        self.breaker.set_memory_bytes(memory);
        if let Some(outcome) = outcome {
            self.emit(LifecycleEvent::BufferEviction {
                tier: outcome.tier.to_string(),
                evicted_entries: outcome.evicted_entries,
                memory_before: outcome.memory_before,
                memory_after: outcome.memory_after,
            });
        }
    }

    /// Run one memory enforcement pass outside of ingestion.
    pub fn enforce_memory_now(&self) -> Option<EvictionOutcome> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let outcome = state.enforce_memory(now);
        let memory = state.total_memory();
        drop(state);
        self.breaker.set_memory_bytes(memory);
        if let Some(outcome) = outcome {
            self.emit(LifecycleEvent::BufferEviction {
                tier: outcome.tier.to_string(),
                evicted_entries: outcome.evicted_entries,
                memory_before: outcome.memory_before,
                memory_after: outcome.memory_after,
            });
        }
        outcome
    }

    /// Periodic memory enforcement until `shutdown` changes.
    pub fn spawn_memory_enforcement(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let capture = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        capture.enforce_memory_now();
                    }
                    _ = shutdown.changed() => {
                        debug!("memory enforcement task shutting down");
                        break;
                    }
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Oldest insertion time still visible under the read TTL.
    fn ttl_cutoff(&self) -> Option<Instant> {
        let ttl = self.config.buffers.ttl()?;
        self.clock.now().checked_sub(ttl)
    }

    /// WebSocket events, newest first.
    #[must_use]
    pub fn get_websocket_events(&self, filter: &WebSocketEventFilter) -> Vec<WebSocketEvent> {
        let limit = positive_or(filter.limit, self.config.buffers.default_ws_limit);
        let cutoff = self.ttl_cutoff();
        let state = self.lock_state();
        fresh(&state.websocket, cutoff)
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Network bodies, newest first.
    #[must_use]
    pub fn get_network_bodies(&self, filter: &NetworkBodyFilter) -> Vec<NetworkBody> {
        let limit = positive_or(filter.limit, self.config.buffers.default_body_limit);
        let cutoff = self.ttl_cutoff();
        let state = self.lock_state();
        fresh(&state.network, cutoff)
            .rev()
            .filter(|b| filter.matches(b))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Actions, oldest first; `last_n` keeps only the newest matches.
    #[must_use]
    pub fn get_enhanced_actions(&self, filter: &EnhancedActionFilter) -> Vec<EnhancedAction> {
        let cutoff = self.ttl_cutoff();
        let state = self.lock_state();
        let mut out: Vec<EnhancedAction> = fresh(&state.actions, cutoff)
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        if let Some(n) = filter.last_n.filter(|n| *n > 0) {
            if out.len() > n {
                out.drain(..out.len() - n);
            }
        }
        out
    }

    #[must_use]
    pub fn get_extension_logs(&self) -> Vec<ExtensionLog> {
        let cutoff = self.ttl_cutoff();
        let state = self.lock_state();
        fresh(&state.logs, cutoff).cloned().collect()
    }

    #[must_use]
    pub fn get_all_websocket_events(&self) -> Vec<WebSocketEvent> {
        self.lock_state().websocket.get_all()
    }

    #[must_use]
    pub fn get_all_network_bodies(&self) -> Vec<NetworkBody> {
        self.lock_state().network.get_all()
    }

    #[must_use]
    pub fn get_all_enhanced_actions(&self) -> Vec<EnhancedAction> {
        self.lock_state().actions.get_all()
    }

    #[must_use]
    pub fn websocket_timestamps(&self) -> Vec<Instant> {
        self.lock_state().websocket.inserted_at()
    }

    #[must_use]
    pub fn network_timestamps(&self) -> Vec<Instant> {
        self.lock_state().network.inserted_at()
    }

    #[must_use]
    pub fn action_timestamps(&self) -> Vec<Instant> {
        self.lock_state().actions.inserted_at()
    }

    #[must_use]
    pub fn websocket_status(&self, filter: &WebSocketStatusFilter) -> WebSocketStatusResponse {
        self.lock_state().connections.status(filter)
    }

    #[must_use]
    pub fn snapshot(&self) -> CaptureSnapshot {
        let state = self.lock_state();
        CaptureSnapshot {
            websocket_count: state.websocket.len(),
            websocket_total_added: state.websocket.total_added(),
            network_count: state.network.len(),
            network_total_added: state.network.total_added(),
            network_error_total_added: state.network_errors_added,
            action_count: state.actions.len(),
            action_total_added: state.actions.total_added(),
            extension_log_count: state.logs.len(),
            extension_log_total_added: state.logs.total_added(),
        }
    }

    /// Monotonic count of network bodies with status >= 400.
    #[must_use]
    pub fn network_error_total_added(&self) -> u64 {
        self.lock_state().network_errors_added
    }

    #[must_use]
    pub fn memory_status(&self) -> MemoryStatus {
        self.lock_state().memory_status()
    }

    // -------------------------------------------------------------------------
    // Extension state
    // -------------------------------------------------------------------------

    /// Record a sync handshake. Used by [`handle_sync`](Self::handle_sync).
    pub(crate) fn record_sync(
        &self,
        session_id: &str,
        settings: Option<&SyncSettings>,
        client_id: &str,
    ) -> SyncTransition {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let threshold = self.config.queries.disconnect_threshold();
        self.lock_state()
            .extension
            .record_sync(session_id, settings, client_id, now, wall, threshold)
    }

    #[must_use]
    pub fn is_extension_connected(&self) -> bool {
        let now = self.clock.now();
        let threshold = self.config.queries.disconnect_threshold();
        self.lock_state().extension.is_connected(now, threshold)
    }

    #[must_use]
    pub fn extension_status(&self) -> ExtensionStatus {
        let now = self.clock.now();
        let threshold = self.config.queries.disconnect_threshold();
        self.lock_state().extension.status(now, threshold)
    }

    #[must_use]
    pub fn tracking_status(&self) -> TrackingStatus {
        self.lock_state().extension.tracking().clone()
    }

    #[must_use]
    pub fn pilot_enabled(&self) -> bool {
        self.lock_state().extension.pilot_enabled()
    }

    pub fn set_extension_version(&self, version: &str) {
        self.lock_state().extension.set_extension_version(version);
    }

    pub fn set_server_version(&self, version: &str) {
        self.lock_state().server_version = version.to_string();
    }

    #[must_use]
    pub fn server_version(&self) -> String {
        self.lock_state().server_version.clone()
    }

    /// Extension and server versions, and whether `major.minor` differs.
    #[must_use]
    pub fn version_info(&self) -> VersionInfo {
        let state = self.lock_state();
        let extension_version = state.extension.extension_version().to_string();
        let server_version = state.server_version.clone();
        let mismatch = version_mismatch(&extension_version, &server_version);
        VersionInfo {
            extension_version,
            server_version,
            mismatch,
        }
    }

    #[must_use]
    pub fn version_mismatch(&self) -> bool {
        self.version_info().mismatch
    }

    pub fn set_test_boundary_start(&self, id: &str) {
        self.lock_state().extension.start_test(id);
    }

    pub fn set_test_boundary_end(&self, id: &str) {
        self.lock_state().extension.end_test(id);
    }

    #[must_use]
    pub fn active_test_ids(&self) -> Vec<String> {
        self.lock_state().extension.active_test_ids()
    }

    /// Pending queries, after expiring everything if the extension went
    /// quiet past the disconnect threshold.
    pub fn get_pending_queries_disconnect_aware(&self) -> Vec<PendingQueryResponse> {
        let now = self.clock.now();
        let threshold = self.config.queries.disconnect_threshold();
        let stale = self.lock_state().extension.is_stale(now, threshold);
        if stale {
            let expired = self.queries.expire_all_pending_queries(DISCONNECTED_REASON);
            if expired > 0 {
                warn!(
                    reason = DISCONNECTED_REASON,
                    expired,
                    threshold_secs = threshold.as_secs(),
                    "Extension disconnected, expired pending commands"
                );
            }
        }
        self.queries.get_pending_queries()
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let now = self.clock.now();
        let threshold = self.config.queries.disconnect_threshold();
        let mut snapshot = {
            let mut state = self.lock_state();
            let memory = state.memory_status();
            HealthSnapshot {
                websocket_count: state.websocket.len(),
                network_body_count: state.network.len(),
                action_count: state.actions.len(),
                extension_log_count: state.logs.len(),
                connection_count: state.connections.active_count(),
                extension_connected: state.extension.is_connected(now, threshold),
                extension_last_seen: state.extension.last_seen(),
                active_test_id_count: state.extension.active_test_id_count(),
                minimal_mode: memory.minimal_mode,
                memory,
                ..HealthSnapshot::default()
            }
        };

        let circuit = self.breaker.snapshot();
        snapshot.circuit_open = circuit.state == crate::circuit_breaker::CircuitStateKind::Open;
        snapshot.circuit_reason = circuit.reason;
        snapshot.circuit_opened_at = circuit.opened_at.map(crate::clock::rfc3339);
        snapshot.window_event_count = circuit.window_event_count;
        snapshot.memory_bytes = circuit.memory_bytes;

        let queries = self.queries.snapshot();
        let counts = self.queries.command_counts();
        snapshot.pending_query_count = queries.pending_queries;
        snapshot.query_result_count = queries.query_results;
        snapshot.query_timeout_ms = queries.query_timeout_ms;
        snapshot.pending_commands = counts.pending;
        snapshot.completed_commands = counts.completed;
        snapshot.failed_commands = counts.failed;
        snapshot
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    pub fn set_recording_sink(&self, sink: Option<Arc<dyn RecordingSink>>) {
        let mut recorder = self.lock_recorder();
        recorder.sink = sink;
        recorder.active = None;
    }

    fn sink(&self) -> Result<Arc<dyn RecordingSink>> {
        self.lock_recorder()
            .sink
            .clone()
            .ok_or_else(|| Error::Recording("no recording sink configured".to_string()))
    }

    pub fn start_recording(&self, name: &str, url: &str) -> Result<String> {
        let sink = self.sink()?;
        let id = sink.start(name, url)?;
        self.lock_recorder().active = Some(id.clone());
        info!(recording_id = %id, "Recording started");
        Ok(id)
    }

    pub fn stop_recording(&self, id: &str) -> Result<RecordingSummary> {
        let sink = self.sink()?;
        let summary = sink.stop(id)?;
        {
            let mut recorder = self.lock_recorder();
            if recorder.active.as_deref() == Some(id) {
                recorder.active = None;
            }
        }
        info!(recording_id = %id, actions = summary.action_count, "Recording stopped");
        Ok(summary)
    }

    pub fn recording_storage_used(&self) -> Result<u64> {
        self.sink()?.storage_used()
    }

    #[must_use]
    pub fn active_recording(&self) -> Option<String> {
        self.lock_recorder().active.clone()
    }

    fn forward_to_recording(&self, actions: &[EnhancedAction]) {
        let sink = {
            let recorder = self.lock_recorder();
            match (&recorder.sink, &recorder.active) {
                (Some(sink), Some(_)) => Arc::clone(sink),
                _ => return,
            }
        };
        for action in actions {
            if let Err(err) = sink.add_action(action) {
                warn!(error = %err, "Recording sink rejected action");
                break;
            }
        }
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("snapshot", &self.snapshot())
            .field("queries", &self.queries)
            .finish_non_exhaustive()
    }
}

fn fresh<T>(buffer: &RingBuffer<T>, cutoff: Option<Instant>) -> impl DoubleEndedIterator<Item = &T>
where
    T: MemoryEstimate,
{
    buffer
        .iter_entries()
        .filter(move |e| cutoff.is_none_or(|c| e.inserted_at() >= c))
        .map(|e| e.payload())
}

fn positive_or(limit: Option<usize>, default: usize) -> usize {
    limit.filter(|n| *n > 0).unwrap_or(default)
}

//! Pending-query queue, result cache and async command correlation.
//!
//! Two independent lock domains:
//!
//! - **queries**: the bounded pending-query FIFO, the one-shot result cache,
//!   the query ID counter, and waiters blocked on a query result.
//! - **commands**: the correlation-ID table, the failed-command history, and
//!   waiters blocked on a command reaching a terminal status.
//!
//! The queries lock is always released before the commands lock is taken;
//! the two are never held together.
//!
//! Waiting is signal driven. Each blocked call registers its own
//! `oneshot::Sender` keyed by ID; a state change wakes exactly the waiters for
//! that ID. Timed-out waiters remove their registration, so
//! [`QueryDispatcher::waiter_count`] returns to zero at rest.
//!
//! Stale results and finished commands are reclaimed by a sweep that runs
//! from the create and read paths at most once per [`SWEEP_INTERVAL`], so the
//! tables stay bounded without a background task. [`QueryDispatcher::spawn_cleanup`]
//! adds a periodic pass for idle dispatchers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::commands::{
    CommandCounts, CommandResult, CommandStatus, EXPIRED_REASON, FailedHistory, OVERFLOW_REASON,
    TrackedCommand,
};
use crate::config::QueryConfig;
use crate::error::QueryError;

/// Minimum spacing between lazy cleanup sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Wire types
// =============================================================================

/// A command queued for the browser client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQuery {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tab_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
}

impl PendingQuery {
    #[must_use]
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    #[must_use]
    pub fn with_tab_id(mut self, tab_id: i64) -> Self {
        self.tab_id = tab_id;
        self
    }
}

/// A queued query as delivered to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQueryResponse {
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

/// Point-in-time query state for health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub pending_queries: usize,
    pub query_results: usize,
    pub query_timeout_ms: u64,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub results_dropped: usize,
    pub orphans_expired: usize,
    pub commands_dropped: usize,
}

// =============================================================================
// Waiter registry
// =============================================================================

#[derive(Debug, Default)]
struct Waiters {
    next_token: u64,
    by_id: HashMap<String, Vec<(u64, oneshot::Sender<()>)>>,
}

impl Waiters {
    fn register(&mut self, id: &str) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.by_id.entry(id.to_string()).or_default().push((token, tx));
        (token, rx)
    }

    fn cancel(&mut self, id: &str, token: u64) {
        if let Some(list) = self.by_id.get_mut(id) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                self.by_id.remove(id);
            }
        }
    }

    fn wake(&mut self, id: &str) {
        if let Some(list) = self.by_id.remove(id) {
            for (_, tx) in list {
                let _ = tx.send(());
            }
        }
    }

    fn count(&self) -> usize {
        self.by_id.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Lock domains
// =============================================================================

#[derive(Debug)]
struct PendingEntry {
    query: PendingQueryResponse,
    expires: Instant,
    client_id: String,
}

#[derive(Debug)]
struct ResultEntry {
    result: Value,
    client_id: String,
    created_at: Instant,
}

#[derive(Debug)]
struct QueryState {
    pending: VecDeque<PendingEntry>,
    results: HashMap<String, ResultEntry>,
    next_id: u64,
    timeout: Duration,
    waiters: Waiters,
    last_sweep: Instant,
}

impl QueryState {
    fn drop_expired(&mut self, now: Instant) {
        self.pending.retain(|pq| pq.expires > now);
    }

    fn take_result(&mut self, id: &str, client: &str) -> Option<Value> {
        let visible = self
            .results
            .get(id)
            .is_some_and(|entry| client.is_empty() || entry.client_id == client);
        if !visible {
            return None;
        }
        self.results.remove(id).map(|entry| entry.result)
    }
}

#[derive(Debug)]
struct CommandState {
    active: HashMap<String, TrackedCommand>,
    failed: FailedHistory,
    waiters: Waiters,
}

impl CommandState {
    fn lookup(&self, correlation_id: &str, client: &str) -> Option<CommandResult> {
        self.active
            .get(correlation_id)
            .map(|c| &c.record)
            .or_else(|| self.failed.find(correlation_id))
            .filter(|c| c.visible_to(client))
            .cloned()
    }

    fn is_known_terminal(&self, correlation_id: &str) -> bool {
        match self.active.get(correlation_id) {
            Some(cmd) => !cmd.record.is_pending(),
            None => self.failed.find(correlation_id).is_some(),
        }
    }
}

// =============================================================================
// QueryDispatcher
// =============================================================================

/// Broker between control-plane callers and the polling browser client.
pub struct QueryDispatcher {
    config: QueryConfig,
    clock: SharedClock,
    queries: Mutex<QueryState>,
    commands: Mutex<CommandState>,
    query_arrived: Notify,
}

impl QueryDispatcher {
    #[must_use]
    pub fn new(config: QueryConfig, clock: SharedClock) -> Self {
        let timeout = config.default_timeout();
        let failed = FailedHistory::new(config.failed_history);
        let now = clock.now();
        Self {
            config,
            clock,
            queries: Mutex::new(QueryState {
                pending: VecDeque::new(),
                results: HashMap::new(),
                next_id: 0,
                timeout,
                waiters: Waiters::default(),
                last_sweep: now,
            }),
            commands: Mutex::new(CommandState {
                active: HashMap::new(),
                failed,
                waiters: Waiters::default(),
            }),
            query_arrived: Notify::new(),
        }
    }

    fn lock_queries(&self) -> MutexGuard<'_, QueryState> {
        match self.queries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_commands(&self) -> MutexGuard<'_, CommandState> {
        match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -------------------------------------------------------------------------
    // Pending queries
    // -------------------------------------------------------------------------

    /// Queue a query with the default timeout and no owning client.
    pub fn create_pending_query(&self, query: PendingQuery) -> String {
        let timeout = self.query_timeout();
        self.create_pending_query_with_timeout(query, timeout, "")
    }

    pub fn create_pending_query_with_client(&self, query: PendingQuery, client_id: &str) -> String {
        let timeout = self.query_timeout();
        self.create_pending_query_with_timeout(query, timeout, client_id)
    }

    /// Queue a query and, when it carries a correlation ID, register its
    /// command. Returns the assigned `q-<n>` ID.
    pub fn create_pending_query_with_timeout(
        &self,
        query: PendingQuery,
        timeout: Duration,
        client_id: &str,
    ) -> String {
        self.maybe_sweep();
        let now = self.clock.now();
        let (id, dropped) = {
            let mut state = self.lock_queries();
            let mut dropped = None;
            if state.pending.len() >= self.config.max_pending.max(1) {
                if let Some(oldest) = state.pending.pop_front() {
                    warn!(
                        query_id = %oldest.query.id,
                        correlation_id = %oldest.query.correlation_id,
                        "Query queue overflow, dropping oldest"
                    );
                    dropped = Some(oldest.query.correlation_id);
                }
            }
            state.next_id += 1;
            let id = format!("q-{}", state.next_id);
            state.pending.push_back(PendingEntry {
                query: PendingQueryResponse {
                    id: id.clone(),
                    kind: query.kind,
                    params: query.params,
                    tab_id: query.tab_id,
                    correlation_id: query.correlation_id.clone(),
                },
                expires: now + timeout,
                client_id: client_id.to_string(),
            });
            (id, dropped)
        };

        if let Some(correlation_id) = dropped.filter(|c| !c.is_empty()) {
            self.expire_command_with_reason(&correlation_id, OVERFLOW_REASON);
        }
        self.query_arrived.notify_one();
        if !query.correlation_id.is_empty() {
            self.register_command_for_client(&query.correlation_id, &id, timeout, client_id);
        }
        id
    }

    /// Resolve once a query is queued, or after `timeout`.
    pub async fn wait_for_pending_queries(&self, timeout: Duration) {
        if !self.lock_queries().pending.is_empty() {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.query_arrived.notified()).await;
    }

    /// Live queries, oldest first. Expired entries are dropped and their
    /// commands expired first.
    pub fn get_pending_queries(&self) -> Vec<PendingQueryResponse> {
        self.pending_queries_matching(None)
    }

    pub fn get_pending_queries_for_client(&self, client_id: &str) -> Vec<PendingQueryResponse> {
        self.pending_queries_matching(Some(client_id))
    }

    fn pending_queries_matching(&self, client: Option<&str>) -> Vec<PendingQueryResponse> {
        self.maybe_sweep();
        self.clean_expired_commands();
        let now = self.clock.now();
        let mut state = self.lock_queries();
        state.drop_expired(now);
        state
            .pending
            .iter()
            .filter(|pq| client.is_none_or(|c| pq.client_id == c))
            .map(|pq| pq.query.clone())
            .collect()
    }

    /// Drop the acknowledged query and everything queued before it.
    pub fn acknowledge_pending_query(&self, query_id: &str) {
        if query_id.is_empty() {
            return;
        }
        let mut state = self.lock_queries();
        if let Some(idx) = state.pending.iter().position(|pq| pq.query.id == query_id) {
            state.pending.drain(..=idx);
        }
    }

    /// Clear the queue and expire every still-pending command, queued or not.
    /// Returns how many commands were expired.
    pub fn expire_all_pending_queries(&self, reason: &str) -> usize {
        let dropped = {
            let mut state = self.lock_queries();
            let n = state.pending.len();
            state.pending.clear();
            n
        };

        let now = self.clock.wall();
        let expired = {
            let mut commands = self.lock_commands();
            let pending: Vec<String> = commands
                .active
                .iter()
                .filter(|(_, c)| c.record.is_pending())
                .map(|(id, _)| id.clone())
                .collect();
            for correlation_id in &pending {
                if let Some(mut cmd) = commands.active.remove(correlation_id) {
                    cmd.record.status = CommandStatus::Expired;
                    cmd.record.error = reason.to_string();
                    cmd.record.completed_at = Some(now);
                    commands.failed.push(cmd.record);
                }
                commands.waiters.wake(correlation_id);
            }
            pending.len()
        };
        if dropped > 0 || expired > 0 {
            warn!(reason, queries = dropped, count = expired, "Expired all pending commands");
        }
        expired
    }

    /// 0-based position of the query carrying `correlation_id`.
    pub fn queue_position(&self, correlation_id: &str) -> Option<usize> {
        self.lock_queries()
            .pending
            .iter()
            .position(|pq| pq.query.correlation_id == correlation_id)
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_queries().pending.len()
    }

    pub fn set_query_timeout(&self, timeout: Duration) {
        self.lock_queries().timeout = timeout;
    }

    pub fn query_timeout(&self) -> Duration {
        self.lock_queries().timeout
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        let state = self.lock_queries();
        QuerySnapshot {
            pending_queries: state.pending.len(),
            query_results: state.results.len(),
            query_timeout_ms: state.timeout.as_millis() as u64,
        }
    }

    // -------------------------------------------------------------------------
    // Query results
    // -------------------------------------------------------------------------

    /// Store a result and complete the correlated command.
    pub fn set_query_result(&self, id: &str, result: Value) {
        self.store_result(id, result, "", true);
    }

    pub fn set_query_result_with_client(&self, id: &str, result: Value, client_id: &str) {
        self.store_result(id, result, client_id, true);
    }

    /// Store a result without touching the command; returns the correlation
    /// ID the query carried, for a separate status update.
    pub fn set_query_result_only(&self, id: &str, result: Value, client_id: &str) -> Option<String> {
        self.store_result(id, result, client_id, false)
    }

    fn store_result(
        &self,
        id: &str,
        result: Value,
        client_id: &str,
        mark_complete: bool,
    ) -> Option<String> {
        let now = self.clock.now();
        let correlation_id = {
            let mut state = self.lock_queries();
            let correlation_id = state
                .pending
                .iter()
                .find(|pq| pq.query.id == id)
                .map(|pq| pq.query.correlation_id.clone())
                .filter(|c| !c.is_empty());
            state.pending.retain(|pq| pq.query.id != id);
            state.results.insert(
                id.to_string(),
                ResultEntry {
                    result: result.clone(),
                    client_id: client_id.to_string(),
                    created_at: now,
                },
            );
            state.waiters.wake(id);
            correlation_id
        };

        if mark_complete {
            if let Some(correlation_id) = &correlation_id {
                self.complete_command(correlation_id, Some(result), "");
            }
        }
        correlation_id
    }

    /// One-time read of a query result.
    pub fn get_query_result(&self, id: &str) -> Option<Value> {
        self.lock_queries().take_result(id, "")
    }

    /// One-time read; when `client_id` is non-empty only the owner may read.
    pub fn get_query_result_for_client(&self, id: &str, client_id: &str) -> Option<Value> {
        self.lock_queries().take_result(id, client_id)
    }

    pub async fn wait_for_result(&self, id: &str, timeout: Duration) -> Result<Value, QueryError> {
        self.wait_for_result_with_client(id, timeout, "").await
    }

    /// Wait for a query result, consuming it on success.
    pub async fn wait_for_result_with_client(
        &self,
        id: &str,
        timeout: Duration,
        client_id: &str,
    ) -> Result<Value, QueryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (token, rx) = {
                let mut state = self.lock_queries();
                if let Some(result) = state.take_result(id, client_id) {
                    return Ok(result);
                }
                state.waiters.register(id)
            };
            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                let mut state = self.lock_queries();
                state.waiters.cancel(id, token);
                if let Some(result) = state.take_result(id, client_id) {
                    return Ok(result);
                }
                return Err(QueryError::Timeout {
                    id: id.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Track a pending command. Empty IDs are ignored, as are IDs that already
    /// reached a terminal status.
    pub fn register_command(&self, correlation_id: &str, query_id: &str, timeout: Duration) {
        self.register_command_for_client(correlation_id, query_id, timeout, "");
    }

    pub fn register_command_for_client(
        &self,
        correlation_id: &str,
        query_id: &str,
        timeout: Duration,
        client_id: &str,
    ) {
        if correlation_id.is_empty() {
            return;
        }
        self.maybe_sweep();
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut commands = self.lock_commands();
        if commands.is_known_terminal(correlation_id) {
            debug!(correlation_id, query_id, "Ignoring re-registration of finished command");
            return;
        }
        commands.active.insert(
            correlation_id.to_string(),
            TrackedCommand {
                record: CommandResult::pending(correlation_id, client_id, wall),
                registered_at: now,
                deadline: (!timeout.is_zero()).then(|| now + timeout),
            },
        );
        debug!(correlation_id, query_id, client_id, "Command registered");
    }

    /// Apply a client-reported status string.
    pub fn apply_command_result(
        &self,
        correlation_id: &str,
        status: &str,
        result: Option<Value>,
        error: &str,
    ) -> bool {
        self.transition(correlation_id, CommandStatus::normalize(status), result, error)
    }

    pub fn complete_command_with_status(
        &self,
        correlation_id: &str,
        result: Option<Value>,
        status: &str,
        error: &str,
    ) -> bool {
        self.apply_command_result(correlation_id, status, result, error)
    }

    pub fn complete_command(&self, correlation_id: &str, result: Option<Value>, error: &str) -> bool {
        self.transition(correlation_id, CommandStatus::Complete, result, error)
    }

    pub fn expire_command(&self, correlation_id: &str) -> bool {
        self.expire_command_with_reason(correlation_id, EXPIRED_REASON)
    }

    pub fn expire_command_with_reason(&self, correlation_id: &str, reason: &str) -> bool {
        self.transition(correlation_id, CommandStatus::Expired, None, reason)
    }

    /// Move a pending command to `status`. Returns false (and changes nothing)
    /// when the command is unknown or already terminal.
    fn transition(
        &self,
        correlation_id: &str,
        status: CommandStatus,
        result: Option<Value>,
        error: &str,
    ) -> bool {
        if correlation_id.is_empty() {
            return false;
        }
        let wall = self.clock.wall();
        let mut commands = self.lock_commands();
        let Some(cmd) = commands.active.get_mut(correlation_id) else {
            return false;
        };
        if !cmd.record.is_pending() {
            return false;
        }
        cmd.record.status = status;
        cmd.record.result = result;
        cmd.record.error = error.to_string();
        if status.is_terminal() {
            cmd.record.completed_at = Some(wall);
        }
        if status.is_failure() {
            if let Some(cmd) = commands.active.remove(correlation_id) {
                commands.failed.push(cmd.record);
            }
        }
        commands.waiters.wake(correlation_id);
        debug!(correlation_id, status = %status, "Command status updated");
        true
    }

    /// Expire pending commands whose query has expired or whose own deadline
    /// has passed.
    fn clean_expired_commands(&self) {
        let now = self.clock.now();
        let mut due: HashSet<String> = {
            let state = self.lock_queries();
            state
                .pending
                .iter()
                .filter(|pq| pq.expires <= now && !pq.query.correlation_id.is_empty())
                .map(|pq| pq.query.correlation_id.clone())
                .collect()
        };
        {
            let commands = self.lock_commands();
            due.extend(
                commands
                    .active
                    .iter()
                    .filter(|(_, c)| c.record.is_pending() && c.deadline.is_some_and(|d| d <= now))
                    .map(|(id, _)| id.clone()),
            );
        }
        for correlation_id in due {
            self.expire_command(&correlation_id);
        }
    }

    pub fn get_command_result(&self, correlation_id: &str) -> Option<CommandResult> {
        self.get_command_result_for_client(correlation_id, "")
    }

    /// Command snapshot, hidden when owned by a different client.
    pub fn get_command_result_for_client(
        &self,
        correlation_id: &str,
        client_id: &str,
    ) -> Option<CommandResult> {
        self.clean_expired_commands();
        self.lock_commands().lookup(correlation_id, client_id)
    }

    pub async fn wait_for_command(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Option<CommandResult> {
        self.wait_for_command_for_client(correlation_id, timeout, "").await
    }

    /// Wait until the command is terminal or `timeout` elapses, then return its
    /// current snapshot (still pending on timeout). None when unknown or not
    /// visible to `client_id`.
    pub async fn wait_for_command_for_client(
        &self,
        correlation_id: &str,
        timeout: Duration,
        client_id: &str,
    ) -> Option<CommandResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.clean_expired_commands();
            let (token, rx) = {
                let mut commands = self.lock_commands();
                match commands.lookup(correlation_id, client_id) {
                    None => return None,
                    Some(cmd) if !cmd.is_pending() => return Some(cmd),
                    Some(_) => commands.waiters.register(correlation_id),
                }
            };
            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                self.lock_commands().waiters.cancel(correlation_id, token);
                return self.get_command_result_for_client(correlation_id, client_id);
            }
        }
    }

    pub fn get_pending_commands(&self) -> Vec<CommandResult> {
        self.active_with_status(CommandStatus::Pending)
    }

    pub fn get_completed_commands(&self) -> Vec<CommandResult> {
        self.active_with_status(CommandStatus::Complete)
    }

    fn active_with_status(&self, status: CommandStatus) -> Vec<CommandResult> {
        self.maybe_sweep();
        self.clean_expired_commands();
        let commands = self.lock_commands();
        let mut out: Vec<CommandResult> = commands
            .active
            .values()
            .filter(|c| c.record.status == status)
            .map(|c| c.record.clone())
            .collect();
        sort_by_creation(&mut out);
        out
    }

    /// Failed history plus failure statuses still in the active table,
    /// deduplicated by correlation ID.
    pub fn get_failed_commands(&self) -> Vec<CommandResult> {
        self.maybe_sweep();
        self.clean_expired_commands();
        let commands = self.lock_commands();
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(commands.failed.len());
        for cmd in commands.failed.iter() {
            seen.insert(cmd.correlation_id.clone());
            out.push(cmd.clone());
        }
        let mut extra: Vec<CommandResult> = commands
            .active
            .values()
            .filter(|c| c.record.is_failed() && !seen.contains(&c.record.correlation_id))
            .map(|c| c.record.clone())
            .collect();
        sort_by_creation(&mut extra);
        out.extend(extra);
        out
    }

    pub fn command_counts(&self) -> CommandCounts {
        let commands = self.lock_commands();
        let mut counts = CommandCounts {
            failed: commands.failed.len(),
            ..CommandCounts::default()
        };
        for cmd in commands.active.values() {
            match cmd.record.status {
                CommandStatus::Pending => counts.pending += 1,
                CommandStatus::Complete => counts.completed += 1,
                _ => counts.failed += 1,
            }
        }
        counts
    }

    /// Live wait registrations across both lock domains.
    pub fn waiter_count(&self) -> usize {
        let queries = self.lock_queries().waiters.count();
        queries + self.lock_commands().waiters.count()
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    /// Run [`cleanup_expired`](Self::cleanup_expired) if the last sweep is at
    /// least [`SWEEP_INTERVAL`] old.
    fn maybe_sweep(&self) {
        let now = self.clock.now();
        {
            let mut state = self.lock_queries();
            if now.saturating_duration_since(state.last_sweep) < SWEEP_INTERVAL {
                return;
            }
            state.last_sweep = now;
        }
        self.cleanup_expired();
    }

    /// Drop stale results, orphaned queries and finished commands.
    pub fn cleanup_expired(&self) -> CleanupReport {
        self.clean_expired_commands();
        let now = self.clock.now();
        let ttl = self.config.result_ttl();
        let grace = self.config.orphan_grace();
        let mut report = CleanupReport::default();

        let orphans: Vec<String> = {
            let mut state = self.lock_queries();
            let before = state.results.len();
            state
                .results
                .retain(|_, entry| now.saturating_duration_since(entry.created_at) <= ttl);
            report.results_dropped = before - state.results.len();

            let mut orphans = Vec::new();
            state.pending.retain(|pq| {
                let orphaned = now.saturating_duration_since(pq.expires) > grace;
                if orphaned && !pq.query.correlation_id.is_empty() {
                    orphans.push(pq.query.correlation_id.clone());
                }
                !orphaned
            });
            orphans
        };

        for correlation_id in &orphans {
            if self.expire_command(correlation_id) {
                report.orphans_expired += 1;
            }
        }

        {
            let mut commands = self.lock_commands();
            let before = commands.active.len();
            commands.active.retain(|_, c| {
                c.record.is_pending() || now.saturating_duration_since(c.registered_at) <= ttl
            });
            report.commands_dropped = before - commands.active.len();
        }

        if report != CleanupReport::default() {
            debug!(
                results = report.results_dropped,
                orphans = report.orphans_expired,
                commands = report.commands_dropped,
                "Query cleanup pass"
            );
        }
        report
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` until
    /// `shutdown` changes.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.cleanup_expired();
                    }
                    _ = shutdown.changed() => {
                        debug!("query cleanup task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for QueryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDispatcher")
            .field("snapshot", &self.snapshot())
            .field("commands", &self.command_counts())
            .finish_non_exhaustive()
    }
}

fn sort_by_creation(list: &mut [CommandResult]) {
    list.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.correlation_id.cmp(&b.correlation_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::commands::DISCONNECTED_REASON;
    use serde_json::json;

    fn dispatcher() -> (Arc<QueryDispatcher>, ManualClock) {
        let clock = ManualClock::new();
        (
            Arc::new(QueryDispatcher::new(QueryConfig::default(), clock.shared())),
            clock,
        )
    }

    fn query(correlation_id: &str) -> PendingQuery {
        PendingQuery::new("dom_query", json!({"selector": "h1"})).with_correlation_id(correlation_id)
    }

    // -- Queue ------------------------------------------------------------------

    #[test]
    fn ids_are_monotonic() {
        let (qd, _clock) = dispatcher();
        assert_eq!(qd.create_pending_query(query("")), "q-1");
        assert_eq!(qd.create_pending_query(query("")), "q-2");
        assert_eq!(qd.queue_depth(), 2);
    }

    #[test]
    fn overflow_drops_oldest_and_expires_its_command() {
        let (qd, _clock) = dispatcher();
        for i in 0..5 {
            qd.create_pending_query(query(&format!("c{i}")));
        }
        qd.create_pending_query(query("c5"));

        let pending = qd.get_pending_queries();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0].id, "q-2");
        assert_eq!(qd.queue_position("c0"), None);
        assert_eq!(qd.queue_position("c5"), Some(4));

        let dropped = qd.get_command_result("c0").unwrap();
        assert_eq!(dropped.status, CommandStatus::Expired);
        assert_eq!(dropped.error, OVERFLOW_REASON);
    }

    #[test]
    fn acknowledge_removes_prefix() {
        let (qd, _clock) = dispatcher();
        let ids: Vec<_> = (0..4).map(|_| qd.create_pending_query(query(""))).collect();
        qd.acknowledge_pending_query(&ids[1]);
        let left: Vec<_> = qd.get_pending_queries().into_iter().map(|q| q.id).collect();
        assert_eq!(left, vec![ids[2].clone(), ids[3].clone()]);

        qd.acknowledge_pending_query("q-999");
        assert_eq!(qd.queue_depth(), 2);
    }

    #[test]
    fn client_filtering_of_pending_queries() {
        let (qd, _clock) = dispatcher();
        qd.create_pending_query_with_client(query(""), "a");
        qd.create_pending_query_with_client(query(""), "b");
        assert_eq!(qd.get_pending_queries_for_client("a").len(), 1);
        assert_eq!(qd.get_pending_queries().len(), 2);
    }

    #[test]
    fn expired_queries_vanish_and_expire_commands() {
        let (qd, clock) = dispatcher();
        qd.create_pending_query_with_timeout(query("slow"), Duration::from_secs(2), "");
        clock.advance_secs(3);
        assert!(qd.get_pending_queries().is_empty());
        let cmd = qd.get_command_result("slow").unwrap();
        assert_eq!(cmd.status, CommandStatus::Expired);
        assert_eq!(cmd.error, EXPIRED_REASON);
    }

    // -- Results ----------------------------------------------------------------

    #[test]
    fn result_completes_correlated_command() {
        let (qd, _clock) = dispatcher();
        let id = qd.create_pending_query(query("corr"));
        qd.set_query_result(&id, json!({"ok": true}));

        assert_eq!(qd.queue_depth(), 0);
        let cmd = qd.get_command_result("corr").unwrap();
        assert_eq!(cmd.status, CommandStatus::Complete);
        assert_eq!(cmd.result, Some(json!({"ok": true})));
        assert!(cmd.completed_at.is_some());
    }

    #[test]
    fn result_only_leaves_command_pending() {
        let (qd, _clock) = dispatcher();
        let id = qd.create_pending_query(query("corr"));
        let mapped = qd.set_query_result_only(&id, json!(1), "");
        assert_eq!(mapped.as_deref(), Some("corr"));
        assert!(qd.get_command_result("corr").unwrap().is_pending());
    }

    #[test]
    fn query_result_is_one_time_and_client_scoped() {
        let (qd, _clock) = dispatcher();
        qd.set_query_result_with_client("q-7", json!("x"), "alice");
        assert_eq!(qd.get_query_result_for_client("q-7", "bob"), None);
        assert_eq!(qd.get_query_result_for_client("q-7", "alice"), Some(json!("x")));
        assert_eq!(qd.get_query_result("q-7"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_result_times_out_without_leaking() {
        let (qd, _clock) = dispatcher();
        let err = qd.wait_for_result("q-1", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout { waited_ms: 50, .. }));
        assert_eq!(qd.waiter_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_result_wakes_on_store() {
        let (qd, _clock) = dispatcher();
        let setter = Arc::clone(&qd);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set_query_result("q-3", json!(42));
        });
        let value = qd.wait_for_result("q-3", Duration::from_secs(5)).await.unwrap();
        assert_eq!(value, json!(42));
        assert_eq!(qd.waiter_count(), 0);
    }

    // -- Commands ---------------------------------------------------------------

    #[test]
    fn empty_correlation_id_is_not_tracked() {
        let (qd, _clock) = dispatcher();
        qd.register_command("", "q-1", Duration::from_secs(1));
        assert_eq!(qd.command_counts(), CommandCounts::default());
    }

    #[test]
    fn first_terminal_write_wins() {
        let (qd, _clock) = dispatcher();
        qd.register_command("c", "q-1", Duration::from_secs(30));
        assert!(qd.complete_command("c", Some(json!("r")), ""));
        assert!(!qd.expire_command("c"));
        let cmd = qd.get_command_result("c").unwrap();
        assert_eq!(cmd.status, CommandStatus::Complete);
        assert_eq!(cmd.result, Some(json!("r")));
    }

    #[test]
    fn expired_command_ignores_late_completion() {
        let (qd, _clock) = dispatcher();
        qd.register_command("c", "q-1", Duration::from_secs(30));
        assert!(qd.expire_command("c"));
        assert!(!qd.complete_command("c", Some(json!("late")), ""));
        let cmd = qd.get_command_result("c").unwrap();
        assert_eq!(cmd.status, CommandStatus::Expired);
        assert_eq!(qd.get_failed_commands().len(), 1);
    }

    #[test]
    fn reregistering_finished_command_is_ignored() {
        let (qd, _clock) = dispatcher();
        qd.register_command("c", "q-1", Duration::from_secs(30));
        qd.complete_command("c", None, "");
        qd.register_command("c", "q-2", Duration::from_secs(30));
        assert_eq!(qd.get_command_result("c").unwrap().status, CommandStatus::Complete);
    }

    #[test]
    fn client_status_is_normalised() {
        let (qd, _clock) = dispatcher();
        qd.register_command("a", "", Duration::ZERO);
        qd.register_command("b", "", Duration::ZERO);

        assert!(qd.apply_command_result("a", "still_processing", None, ""));
        assert!(qd.get_command_result("a").unwrap().is_pending());
        assert!(qd.apply_command_result("a", "SUCCESS", Some(json!(1)), ""));
        assert_eq!(qd.get_command_result("a").unwrap().status, CommandStatus::Complete);

        assert!(qd.complete_command_with_status("b", None, "canceled", "user aborted"));
        let b = qd.get_command_result("b").unwrap();
        assert_eq!(b.status, CommandStatus::Cancelled);
        assert_eq!(b.error, "user aborted");
        assert_eq!(qd.command_counts().failed, 1);
    }

    #[test]
    fn own_deadline_expires_lazily() {
        let (qd, clock) = dispatcher();
        qd.register_command("c", "q-1", Duration::from_secs(5));
        clock.advance_secs(6);
        let cmd = qd.get_command_result("c").unwrap();
        assert_eq!(cmd.status, CommandStatus::Expired);
        assert_eq!(cmd.error, EXPIRED_REASON);
    }

    #[test]
    fn client_isolation_hides_foreign_commands() {
        let (qd, _clock) = dispatcher();
        qd.register_command_for_client("c", "q-1", Duration::from_secs(5), "alice");
        assert!(qd.get_command_result_for_client("c", "bob").is_none());
        assert!(qd.get_command_result_for_client("c", "alice").is_some());
        assert!(qd.get_command_result("c").is_some());
    }

    #[test]
    fn expire_all_only_touches_pending() {
        let (qd, _clock) = dispatcher();
        qd.create_pending_query(query("done"));
        qd.create_pending_query(query("open"));
        qd.complete_command("done", None, "");

        assert_eq!(qd.expire_all_pending_queries(DISCONNECTED_REASON), 1);
        assert_eq!(qd.queue_depth(), 0);
        assert_eq!(qd.get_command_result("done").unwrap().status, CommandStatus::Complete);
        let open = qd.get_command_result("open").unwrap();
        assert_eq!(open.status, CommandStatus::Expired);
        assert_eq!(open.error, DISCONNECTED_REASON);
    }

    #[test]
    fn expire_all_reaches_unqueued_commands() {
        let (qd, _clock) = dispatcher();
        qd.register_command("direct", "", Duration::from_secs(30));
        assert_eq!(qd.expire_all_pending_queries(DISCONNECTED_REASON), 1);
        assert_eq!(
            qd.get_command_result("direct").unwrap().status,
            CommandStatus::Expired
        );
    }

    #[test]
    fn failed_commands_include_active_failures_once() {
        let (qd, _clock) = dispatcher();
        qd.register_command("e", "", Duration::ZERO);
        qd.apply_command_result("e", "error", None, "boom");
        let failed = qd.get_failed_commands();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "boom");
    }

    #[tokio::test]
    async fn wait_for_command_wakes_on_completion() {
        let (qd, _clock) = dispatcher();
        qd.register_command("c", "q-1", Duration::from_secs(60));
        let completer = Arc::clone(&qd);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            completer.complete_command("c", Some(json!("done")), "");
        });
        let started = std::time::Instant::now();
        let cmd = qd.wait_for_command("c", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Complete);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(qd.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_command_returns_pending_on_timeout() {
        let (qd, _clock) = dispatcher();
        qd.register_command("c", "q-1", Duration::from_secs(60));
        let cmd = qd.wait_for_command("c", Duration::from_millis(100)).await.unwrap();
        assert!(cmd.is_pending());
        assert_eq!(qd.waiter_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_unknown_command_returns_none() {
        let (qd, _clock) = dispatcher();
        assert!(qd.wait_for_command("nope", Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_query_wait_returns_early() {
        let (qd, _clock) = dispatcher();
        let producer = Arc::clone(&qd);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer.create_pending_query(query(""));
        });
        let started = tokio::time::Instant::now();
        qd.wait_for_pending_queries(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(qd.queue_depth(), 1);
    }

    // -- Cleanup ----------------------------------------------------------------

    #[test]
    fn cleanup_drops_stale_state() {
        let (qd, clock) = dispatcher();
        qd.set_query_result("q-old", json!(1));
        qd.create_pending_query_with_timeout(query("orphan"), Duration::from_secs(1), "");
        qd.register_command("finished", "", Duration::ZERO);
        qd.complete_command("finished", None, "");
        qd.register_command("waiting", "", Duration::ZERO);

        clock.advance_secs(61);
        let report = qd.cleanup_expired();
        assert_eq!(report.results_dropped, 1);
        assert_eq!(report.commands_dropped, 1);
        assert_eq!(qd.queue_depth(), 0);
        assert_eq!(qd.get_command_result("orphan").unwrap().status, CommandStatus::Expired);
        assert!(qd.get_command_result("finished").is_none());
        assert!(qd.get_command_result("waiting").unwrap().is_pending());
    }

    #[test]
    fn reads_reclaim_finished_state_without_a_task() {
        let (qd, clock) = dispatcher();
        for i in 0..1000 {
            let corr = format!("c-{i}");
            qd.register_command(&corr, "", Duration::ZERO);
            qd.complete_command(&corr, Some(json!(i)), "");
            qd.set_query_result(&format!("q-x{i}"), json!(i));
        }
        assert_eq!(qd.get_completed_commands().len(), 1000);

        clock.advance_secs(3600);
        assert!(qd.get_completed_commands().is_empty());
        assert!(qd.get_pending_queries().is_empty());
        assert_eq!(qd.snapshot().query_results, 0);
        assert_eq!(qd.command_counts().completed, 0);
    }

    #[test]
    fn sweep_is_rate_limited() {
        let (qd, clock) = dispatcher();
        qd.set_query_result("q-a", json!(1));
        clock.advance_secs(59);
        assert!(qd.get_pending_queries().is_empty());
        assert_eq!(qd.snapshot().query_results, 1);

        // Past the TTL, but the last sweep is only six seconds old.
        clock.advance_secs(6);
        assert!(qd.get_pending_queries().is_empty());
        assert_eq!(qd.snapshot().query_results, 1);

        clock.advance_secs(24);
        assert!(qd.get_pending_queries().is_empty());
        assert_eq!(qd.snapshot().query_results, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_stops_on_shutdown() {
        let (qd, _clock) = dispatcher();
        let (tx, rx) = watch::channel(false);
        let handle = qd.spawn_cleanup(Duration::from_secs(30), rx);
        tokio::time::sleep(Duration::from_secs(65)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn snapshot_reports_timeout() {
        let (qd, _clock) = dispatcher();
        qd.set_query_timeout(Duration::from_secs(3));
        let snap = qd.snapshot();
        assert_eq!(snap.query_timeout_ms, 3000);
        assert_eq!(qd.query_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn pending_query_wire_shape() {
        let q = PendingQuery::new("exec", json!({})).with_tab_id(9);
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["type"], "exec");
        assert_eq!(v["tab_id"], 9);
        assert!(v.get("correlation_id").is_none());
    }
}

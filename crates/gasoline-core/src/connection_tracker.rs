//! Per-connection WebSocket state derived from the event stream.
//!
//! Active connections live in a map with an insertion-order list used for
//! LRU eviction once `max_active` is reached. Closing a connection moves a
//! final snapshot into a bounded closed history.
//!
//! Message rates are computed on read from a pruned window of timestamps, so
//! a status read always reflects the trailing `rate_window`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::config::ConnectionConfig;
use crate::types::{WebSocketEvent, WebSocketStatusFilter};

/// Longest data preview kept per direction.
const PREVIEW_CHARS: usize = 200;

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    Error,
}

impl ConnState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Default)]
struct DirectionStats {
    total: u64,
    bytes: u64,
    last_at: String,
    last_data: String,
    /// Parsed message times inside the rate window, oldest first.
    recent: VecDeque<DateTime<Utc>>,
}

impl DirectionStats {
    fn record(&mut self, event: &WebSocketEvent, at: Option<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        self.total += 1;
        self.bytes += event.size;
        self.last_at.clone_from(&event.ts);
        self.last_data = preview(&event.data);
        self.prune(cutoff);
        if let Some(at) = at {
            self.recent.push_back(at);
        }
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.recent.front().is_some_and(|t| *t < cutoff) {
            self.recent.pop_front();
        }
    }

    fn rate(&self, cutoff: DateTime<Utc>, window: Duration) -> f64 {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        let count = self.recent.iter().filter(|t| **t > cutoff).count();
        count as f64 / secs
    }
}

#[derive(Debug)]
struct Connection {
    url: String,
    state: ConnState,
    opened_at: String,
    incoming: DirectionStats,
    outgoing: DirectionStats,
    sampling: bool,
    sampling_rate: String,
}

// =============================================================================
// Status output
// =============================================================================

/// Windowed rate plus running totals for one direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionRate {
    pub per_second: f64,
    pub total: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRates {
    pub incoming: DirectionRate,
    pub outgoing: DirectionRate,
}

/// Most recent message in one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub at: String,
    pub age: String,
    pub preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming: Option<MessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing: Option<MessagePreview>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingStatus {
    pub active: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rate: String,
}

/// One active (open or errored) connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConnection {
    pub id: String,
    pub url: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub opened_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub duration: String,
    pub message_rate: MessageRates,
    pub last_message: LastMessages,
    pub sampling: SamplingStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTotals {
    pub incoming: u64,
    pub outgoing: u64,
}

/// Final snapshot of a closed connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketClosedConnection {
    pub id: String,
    pub url: String,
    pub state: String,
    pub opened_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub closed_at: String,
    pub close_code: u16,
    pub close_reason: String,
    pub total_messages: MessageTotals,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketStatusResponse {
    pub connections: Vec<WebSocketConnection>,
    pub closed: Vec<WebSocketClosedConnection>,
}

// =============================================================================
// ConnectionTracker
// =============================================================================

/// Tracks open WebSocket connections and a short closed history.
///
/// Not internally synchronised; the owner holds it under its own lock.
pub struct ConnectionTracker {
    config: ConnectionConfig,
    clock: SharedClock,
    connections: HashMap<String, Connection>,
    /// Active IDs, oldest open first.
    order: VecDeque<String>,
    closed: VecDeque<WebSocketClosedConnection>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(config: ConnectionConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            connections: HashMap::new(),
            order: VecDeque::new(),
            closed: VecDeque::new(),
        }
    }

    /// Apply one WebSocket event. Unknown event kinds are ignored.
    pub fn track(&mut self, event: &WebSocketEvent) {
        match event.event.as_str() {
            "open" => self.on_open(event),
            "close" => self.on_close(event),
            "error" => {
                if let Some(conn) = self.connections.get_mut(&event.id) {
                    conn.state = ConnState::Error;
                }
            }
            "message" => self.on_message(event),
            _ => {}
        }
    }

    fn on_open(&mut self, event: &WebSocketEvent) {
        if self.connections.contains_key(&event.id) {
            self.order.retain(|id| id != &event.id);
        } else {
            while self.connections.len() >= self.config.max_active.max(1) {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.connections.remove(&oldest);
                tracing::debug!(
                    connection_id = %oldest,
                    max_active = self.config.max_active,
                    "evicted least recent websocket connection"
                );
            }
        }
        self.connections.insert(
            event.id.clone(),
            Connection {
                url: event.url.clone(),
                state: ConnState::Open,
                opened_at: event.ts.clone(),
                incoming: DirectionStats::default(),
                outgoing: DirectionStats::default(),
                sampling: false,
                sampling_rate: String::new(),
            },
        );
        self.order.push_back(event.id.clone());
    }

    fn on_close(&mut self, event: &WebSocketEvent) {
        let Some(conn) = self.connections.remove(&event.id) else {
            return;
        };
        self.order.retain(|id| id != &event.id);
        self.closed.push_back(WebSocketClosedConnection {
            id: event.id.clone(),
            url: conn.url,
            state: "closed".to_string(),
            opened_at: conn.opened_at,
            closed_at: event.ts.clone(),
            close_code: event.close_code,
            close_reason: event.close_reason.clone(),
            total_messages: MessageTotals {
                incoming: conn.incoming.total,
                outgoing: conn.outgoing.total,
            },
        });
        while self.closed.len() > self.config.max_closed {
            self.closed.pop_front();
        }
    }

    fn on_message(&mut self, event: &WebSocketEvent) {
        let cutoff = self.cutoff();
        let Some(conn) = self.connections.get_mut(&event.id) else {
            return;
        };
        let stats = match event.direction.as_str() {
            "incoming" => &mut conn.incoming,
            "outgoing" => &mut conn.outgoing,
            _ => return,
        };
        stats.record(event, parse_ts(&event.ts), cutoff);
        if let Some(sampled) = &event.sampled {
            conn.sampling = true;
            conn.sampling_rate.clone_from(&sampled.rate);
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.rate_window())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.wall() - window
    }

    /// Current view of active and recently closed connections.
    #[must_use]
    pub fn status(&self, filter: &WebSocketStatusFilter) -> WebSocketStatusResponse {
        let now = self.clock.wall();
        let cutoff = self.cutoff();
        let window = self.config.rate_window();

        let connections = self
            .order
            .iter()
            .filter_map(|id| self.connections.get(id).map(|conn| (id, conn)))
            .filter(|(id, conn)| filter.matches(id, &conn.url))
            .map(|(id, conn)| WebSocketConnection {
                id: id.clone(),
                url: conn.url.clone(),
                state: conn.state.as_str().to_string(),
                opened_at: conn.opened_at.clone(),
                duration: parse_ts(&conn.opened_at)
                    .map(|t| format_duration(elapsed(now, t)))
                    .unwrap_or_default(),
                message_rate: MessageRates {
                    incoming: direction_rate(&conn.incoming, cutoff, window),
                    outgoing: direction_rate(&conn.outgoing, cutoff, window),
                },
                last_message: LastMessages {
                    incoming: last_message(&conn.incoming, now),
                    outgoing: last_message(&conn.outgoing, now),
                },
                sampling: SamplingStatus {
                    active: conn.sampling,
                    rate: conn.sampling_rate.clone(),
                },
            })
            .collect();

        let closed = self
            .closed
            .iter()
            .filter(|c| filter.matches(&c.id, &c.url))
            .cloned()
            .collect();

        WebSocketStatusResponse {
            connections,
            closed,
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("active", &self.connections.len())
            .field("closed", &self.closed.len())
            .field("max_active", &self.config.max_active)
            .finish()
    }
}

fn direction_rate(stats: &DirectionStats, cutoff: DateTime<Utc>, window: Duration) -> DirectionRate {
    DirectionRate {
        per_second: stats.rate(cutoff, window),
        total: stats.total,
        bytes: stats.bytes,
    }
}

fn last_message(stats: &DirectionStats, now: DateTime<Utc>) -> Option<MessagePreview> {
    if stats.last_data.is_empty() {
        return None;
    }
    Some(MessagePreview {
        at: stats.last_at.clone(),
        age: format_age(&stats.last_at, now),
        preview: stats.last_data.clone(),
    })
}

fn preview(data: &str) -> String {
    match data.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => data[..cut].to_string(),
        None => data.to_string(),
    }
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

fn format_age(ts: &str, now: DateTime<Utc>) -> String {
    parse_ts(ts)
        .map(|t| format_duration(elapsed(now, t)))
        .unwrap_or_default()
}

/// Human-readable duration: `0.4s`, `5s`, `2m30s`, `2m`, `1h15m`, `1h`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        return format!("{:.1}s", d.as_secs_f64());
    }
    if total < 60 {
        return format!("{total}s");
    }
    if total < 3600 {
        let (m, s) = (total / 60, total % 60);
        return if s == 0 {
            format!("{m}m")
        } else {
            format!("{m}m{s:02}s")
        };
    }
    let (h, m) = (total / 3600, (total % 3600) / 60);
    if m == 0 {
        format!("{h}h")
    } else {
        format!("{h}h{m:02}m")
    }
}

//! Tiered memory enforcement across the telemetry buffers.
//!
//! Total buffered memory (WebSocket events + network bodies + actions) is
//! classified into pressure tiers that drive eviction:
//!
//! - **Normal**: nothing to do
//! - **Soft**: drop the oldest quarter of each buffer
//! - **Hard**: drop the oldest half of each buffer
//! - **Critical**: clear everything and enter minimal mode
//!
//! Buffers are visited network bodies first, then WebSocket events, then
//! actions, stopping as soon as memory is back under the tier limit.
//! Passes are spaced by a cooldown so a burst of ingests evicts once.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::ring_buffer::RingBuffer;
use crate::types::{EnhancedAction, NetworkBody, WebSocketEvent};

// =============================================================================
// Pressure tiers
// =============================================================================

/// Memory pressure severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Normal,
    /// Above the soft limit: evict a quarter.
    Soft,
    /// Above the hard limit: evict half.
    Hard,
    /// Above the critical limit: clear all, minimal mode.
    Critical,
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MemoryTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Critical => "critical",
        }
    }

    /// Numeric value for gauges (0-3).
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Soft => 1,
            Self::Hard => 2,
            Self::Critical => 3,
        }
    }

    /// Classify a byte total against the configured limits.
    #[must_use]
    pub fn classify(total: u64, config: &MemoryConfig) -> Self {
        if total > config.critical_limit {
            Self::Critical
        } else if total > config.hard_limit {
            Self::Hard
        } else if total > config.soft_limit {
            Self::Soft
        } else {
            Self::Normal
        }
    }

    /// Fraction denominator for partial eviction (`len / d` per buffer).
    const fn denominator(self) -> Option<usize> {
        match self {
            Self::Soft => Some(4),
            Self::Hard => Some(2),
            Self::Normal | Self::Critical => None,
        }
    }
}

// =============================================================================
// Status and outcomes
// =============================================================================

/// Memory view for health output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub total_bytes: u64,
    pub websocket_bytes: u64,
    pub network_bytes: u64,
    pub actions_bytes: u64,
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub critical_limit: u64,
    pub minimal_mode: bool,
    pub total_evictions: u64,
    pub evicted_entries: u64,
}

/// Result of one eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub tier: MemoryTier,
    pub evicted_entries: u64,
    pub memory_before: u64,
    pub memory_after: u64,
}

/// The buffers subject to memory enforcement, borrowed together.
pub struct PressuredBuffers<'a> {
    pub network: &'a mut RingBuffer<NetworkBody>,
    pub websocket: &'a mut RingBuffer<WebSocketEvent>,
    pub actions: &'a mut RingBuffer<EnhancedAction>,
}

impl PressuredBuffers<'_> {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.network
            .memory_total()
            .saturating_add(self.websocket.memory_total())
            .saturating_add(self.actions.memory_total())
    }
}

// =============================================================================
// Enforcer
// =============================================================================

/// Tier-driven evictor. Owned by the capture state and used under its lock.
#[derive(Debug)]
pub struct MemoryEnforcer {
    config: MemoryConfig,
    last_eviction: Option<Instant>,
    minimal_mode: bool,
    total_evictions: u64,
    evicted_entries: u64,
}

impl MemoryEnforcer {
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            last_eviction: None,
            minimal_mode: false,
            total_evictions: 0,
            evicted_entries: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// True once a critical pass has run. Minimal mode is sticky.
    #[must_use]
    pub fn minimal_mode(&self) -> bool {
        self.minimal_mode
    }

    /// Count capacity after the minimal-mode adjustment.
    #[must_use]
    pub fn effective_capacity(&self, base: usize) -> usize {
        if self.minimal_mode {
            (base / 2).max(1)
        } else {
            base
        }
    }

    /// Run one enforcement pass unless the cooldown is still running.
    ///
    /// Returns `None` when nothing was evicted.
    pub fn enforce(&mut self, buffers: PressuredBuffers<'_>, now: Instant) -> Option<EvictionOutcome> {
        if self
            .last_eviction
            .is_some_and(|at| now.duration_since(at) < self.config.eviction_cooldown())
        {
            return None;
        }

        let before = buffers.total();
        let tier = MemoryTier::classify(before, &self.config);
        let evicted = match tier {
            MemoryTier::Normal => return None,
            MemoryTier::Critical => self.evict_all(buffers),
            MemoryTier::Soft | MemoryTier::Hard => {
                let limit = if tier == MemoryTier::Hard {
                    self.config.hard_limit
                } else {
                    self.config.soft_limit
                };
                evict_fraction(buffers, tier.denominator().unwrap_or(4), limit)
            }
        };

        self.last_eviction = Some(now);
        self.total_evictions += 1;
        self.evicted_entries += evicted.entries;

        let outcome = EvictionOutcome {
            tier,
            evicted_entries: evicted.entries,
            memory_before: before,
            memory_after: evicted.after,
        };
        if tier == MemoryTier::Critical {
            tracing::error!(
                tier = %tier,
                memory_bytes = before,
                evicted = outcome.evicted_entries,
                "Critical memory pressure, cleared buffers and entered minimal mode"
            );
        } else {
            tracing::warn!(
                tier = %tier,
                memory_bytes = before,
                memory_after = outcome.memory_after,
                evicted = outcome.evicted_entries,
                "Memory pressure eviction"
            );
        }
        Some(outcome)
    }

    fn evict_all(&mut self, buffers: PressuredBuffers<'_>) -> Evicted {
        let entries = (buffers.network.len() + buffers.websocket.len() + buffers.actions.len()) as u64;
        buffers.network.clear();
        buffers.websocket.clear();
        buffers.actions.clear();
        if !self.minimal_mode {
            self.minimal_mode = true;
            halve_capacity(buffers.network);
            halve_capacity(buffers.websocket);
            halve_capacity(buffers.actions);
        }
        Evicted { entries, after: 0 }
    }

    #[must_use]
    pub fn status(&self, buffers: &PressuredBuffers<'_>) -> MemoryStatus {
        let websocket_bytes = buffers.websocket.memory_total();
        let network_bytes = buffers.network.memory_total();
        let actions_bytes = buffers.actions.memory_total();
        MemoryStatus {
            total_bytes: buffers.total(),
            websocket_bytes,
            network_bytes,
            actions_bytes,
            soft_limit: self.config.soft_limit,
            hard_limit: self.config.hard_limit,
            critical_limit: self.config.critical_limit,
            minimal_mode: self.minimal_mode,
            total_evictions: self.total_evictions,
            evicted_entries: self.evicted_entries,
        }
    }
}

struct Evicted {
    entries: u64,
    after: u64,
}

fn halve_capacity<T: crate::ring_buffer::MemoryEstimate>(buffer: &mut RingBuffer<T>) {
    let halved = (buffer.max_count() / 2).max(1);
    buffer.set_max_count(halved);
}

fn evict_share<T: crate::ring_buffer::MemoryEstimate>(
    buffer: &mut RingBuffer<T>,
    denominator: usize,
) -> u64 {
    if buffer.is_empty() {
        return 0;
    }
    let n = (buffer.len() / denominator).max(1);
    buffer.evict_oldest(n) as u64
}

/// Drop `1/denominator` of each buffer in priority order until under `limit`.
fn evict_fraction(buffers: PressuredBuffers<'_>, denominator: usize, limit: u64) -> Evicted {
    let mut entries = evict_share(buffers.network, denominator);
    if buffers.total() > limit {
        entries += evict_share(buffers.websocket, denominator);
    }
    if buffers.total() > limit {
        entries += evict_share(buffers.actions, denominator);
    }
    Evicted {
        entries,
        after: buffers.total(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn small_config() -> MemoryConfig {
        MemoryConfig {
            soft_limit: 10_000,
            hard_limit: 20_000,
            critical_limit: 40_000,
            eviction_cooldown_ms: 1000,
        }
    }

    struct Fixture {
        network: RingBuffer<NetworkBody>,
        websocket: RingBuffer<WebSocketEvent>,
        actions: RingBuffer<EnhancedAction>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                network: RingBuffer::new(1000, None),
                websocket: RingBuffer::new(1000, None),
                actions: RingBuffer::new(100, None),
            }
        }

        fn buffers(&mut self) -> PressuredBuffers<'_> {
            PressuredBuffers {
                network: &mut self.network,
                websocket: &mut self.websocket,
                actions: &mut self.actions,
            }
        }

        /// `n` network bodies of roughly `each` bytes.
        fn fill_network(&mut self, n: usize, each: usize) {
            let bodies = (0..n).map(|_| NetworkBody {
                response_body: "r".repeat(each.saturating_sub(300)),
                ..Default::default()
            });
            self.network.add(bodies, Instant::now());
        }

        fn fill_ws(&mut self, n: usize, each: usize) {
            let events = (0..n).map(|_| WebSocketEvent {
                data: "d".repeat(each.saturating_sub(200)),
                ..Default::default()
            });
            self.websocket.add(events, Instant::now());
        }

        fn fill_actions(&mut self, n: usize) {
            self.actions
                .add((0..n).map(|_| EnhancedAction::default()), Instant::now());
        }
    }

    // -- Tiers ---

    #[test]
    fn tier_ordering() {
        assert!(MemoryTier::Normal < MemoryTier::Soft);
        assert!(MemoryTier::Soft < MemoryTier::Hard);
        assert!(MemoryTier::Hard < MemoryTier::Critical);
    }

    #[test]
    fn classify_default_limits() {
        let config = MemoryConfig::default();
        assert_eq!(MemoryTier::classify(0, &config), MemoryTier::Normal);
        assert_eq!(MemoryTier::classify(20 * MIB, &config), MemoryTier::Normal);
        assert_eq!(MemoryTier::classify(20 * MIB + 1, &config), MemoryTier::Soft);
        assert_eq!(MemoryTier::classify(50 * MIB + 1, &config), MemoryTier::Hard);
        assert_eq!(MemoryTier::classify(100 * MIB + 1, &config), MemoryTier::Critical);
    }

    #[test]
    fn tier_display_and_serde() {
        assert_eq!(MemoryTier::Critical.to_string(), "critical");
        assert_eq!(MemoryTier::Hard.as_u8(), 2);
        let json = serde_json::to_string(&MemoryTier::Soft).unwrap();
        assert_eq!(json, "\"soft\"");
    }

    // -- Eviction ---

    #[test]
    fn normal_does_nothing() {
        let mut fx = Fixture::new();
        fx.fill_network(5, 1000);
        let mut enforcer = MemoryEnforcer::new(small_config());
        assert!(enforcer.enforce(fx.buffers(), Instant::now()).is_none());
        assert_eq!(fx.network.len(), 5);
    }

    #[test]
    fn soft_evicts_quarter_of_network_first() {
        let mut fx = Fixture::new();
        fx.fill_network(12, 1000);
        fx.fill_ws(10, 200);
        let mut enforcer = MemoryEnforcer::new(small_config());

        let outcome = enforcer.enforce(fx.buffers(), Instant::now()).unwrap();

        assert_eq!(outcome.tier, MemoryTier::Soft);
        assert_eq!(fx.network.len(), 9);
        // 9_000 + 2_000 is still over the soft limit, so ws loses a quarter.
        assert_eq!(fx.websocket.len(), 8);
        assert_eq!(outcome.evicted_entries, 5);
        assert_eq!(outcome.memory_after, fx.buffers().total());
    }

    #[test]
    fn stops_once_under_limit() {
        let mut fx = Fixture::new();
        fx.fill_network(20, 1000);
        fx.fill_ws(4, 200);
        fx.fill_actions(2);
        let mut enforcer = MemoryEnforcer::new(small_config());

        let outcome = enforcer.enforce(fx.buffers(), Instant::now()).unwrap();

        // 21_800 is hard tier; halving network bodies alone gets under 20_000.
        assert_eq!(outcome.tier, MemoryTier::Hard);
        assert_eq!(fx.network.len(), 10);
        assert_eq!(fx.websocket.len(), 4);
        assert_eq!(fx.actions.len(), 2);
    }

    #[test]
    fn critical_clears_and_halves_capacity() {
        let mut fx = Fixture::new();
        fx.fill_network(50, 1000);
        fx.fill_actions(10);
        let mut enforcer = MemoryEnforcer::new(small_config());

        let outcome = enforcer.enforce(fx.buffers(), Instant::now()).unwrap();

        assert_eq!(outcome.tier, MemoryTier::Critical);
        assert_eq!(outcome.evicted_entries, 60);
        assert_eq!(outcome.memory_after, 0);
        assert!(fx.network.is_empty() && fx.actions.is_empty());
        assert!(enforcer.minimal_mode());
        assert_eq!(fx.network.max_count(), 500);
        assert_eq!(fx.actions.max_count(), 50);
        assert_eq!(enforcer.effective_capacity(100), 50);
    }

    #[test]
    fn cooldown_spaces_passes() {
        let mut fx = Fixture::new();
        fx.fill_network(30, 1000);
        let mut enforcer = MemoryEnforcer::new(small_config());
        let t0 = Instant::now();

        assert!(enforcer.enforce(fx.buffers(), t0).is_some());
        fx.fill_network(30, 1000);
        assert!(enforcer.enforce(fx.buffers(), t0 + Duration::from_millis(500)).is_none());
        assert!(enforcer.enforce(fx.buffers(), t0 + Duration::from_millis(1000)).is_some());
    }

    #[test]
    fn status_reports_breakdown() {
        let mut fx = Fixture::new();
        fx.fill_network(2, 1000);
        fx.fill_ws(3, 500);
        fx.fill_actions(4);
        let enforcer = MemoryEnforcer::new(small_config());
        let status = enforcer.status(&fx.buffers());
        assert_eq!(status.network_bytes, 2000);
        assert_eq!(status.websocket_bytes, 1500);
        assert_eq!(status.actions_bytes, 2000);
        assert_eq!(status.total_bytes, 5500);
        assert_eq!(status.soft_limit, 10_000);
        assert!(!status.minimal_mode);
    }
}

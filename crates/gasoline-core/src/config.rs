//! Configuration management for the bridge
//!
//! Handles loading and validation of `gasoline.toml`. Every policy constant
//! (capacities, memory budgets, circuit thresholds, timeouts) lives here so
//! deployments can tune them without a rebuild.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};

const MIB: u64 = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Ring buffer capacities and body limits
    pub buffers: BufferConfig,

    /// Ingestion circuit breaker
    pub circuit: CircuitConfig,

    /// Memory pressure tiers
    pub memory: MemoryConfig,

    /// WebSocket connection tracking
    pub connections: ConnectionConfig,

    /// Pending query / command correlation
    pub queries: QueryConfig,

    /// Logging
    pub logging: LogConfig,
}

/// Ring buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    pub max_ws_events: usize,
    pub max_network_bodies: usize,
    pub max_enhanced_actions: usize,
    pub max_extension_logs: usize,
    /// Byte budget for the WebSocket buffer
    pub ws_memory_limit: u64,
    /// Byte budget for the network body buffer
    pub network_memory_limit: u64,
    /// Request bodies longer than this are truncated on ingest
    pub max_request_body: usize,
    /// Response bodies longer than this are truncated on ingest
    pub max_response_body: usize,
    /// Default result count for WebSocket event reads
    pub default_ws_limit: usize,
    /// Default result count for network body reads
    pub default_body_limit: usize,
    /// Read-time TTL in seconds (0 disables)
    pub ttl_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_ws_events: 500,
            max_network_bodies: 100,
            max_enhanced_actions: 50,
            max_extension_logs: 500,
            ws_memory_limit: 4 * MIB,
            network_memory_limit: 8 * MIB,
            max_request_body: 8192,
            max_response_body: 16384,
            default_ws_limit: 50,
            default_body_limit: 20,
            ttl_secs: 0,
        }
    }
}

impl BufferConfig {
    /// Read-time TTL, if enabled.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitConfig {
    /// Events per window above which the window counts as "over"
    pub rate_threshold: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Consecutive over-threshold windows that open the circuit
    pub open_streak: u32,
    /// Continuous below-threshold seconds required to close
    pub close_after_secs: u64,
    /// Memory above which the circuit opens and ingestion is rejected
    pub memory_hard_limit: u64,
    /// Memory must be at or below this to close
    pub memory_close_limit: u64,
    /// Retry hint handed to rejected producers
    pub retry_after_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            rate_threshold: 1000,
            window_ms: 1000,
            open_streak: 5,
            close_after_secs: 10,
            memory_hard_limit: 50 * MIB,
            memory_close_limit: 30 * MIB,
            retry_after_ms: 1000,
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    #[must_use]
    pub fn close_after(&self) -> Duration {
        Duration::from_secs(self.close_after_secs)
    }
}

/// Memory pressure configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub critical_limit: u64,
    /// Minimum spacing between eviction passes
    pub eviction_cooldown_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit: 20 * MIB,
            hard_limit: 50 * MIB,
            critical_limit: 100 * MIB,
            eviction_cooldown_ms: 1000,
        }
    }
}

impl MemoryConfig {
    #[must_use]
    pub fn eviction_cooldown(&self) -> Duration {
        Duration::from_millis(self.eviction_cooldown_ms)
    }
}

/// WebSocket connection tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_active: usize,
    pub max_closed: usize,
    /// Sliding window for message rate, in seconds
    pub rate_window_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_active: 20,
            max_closed: 10,
            rate_window_secs: 5,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

/// Query dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryConfig {
    /// Pending query FIFO depth; oldest dropped on overflow
    pub max_pending: usize,
    pub default_timeout_secs: u64,
    /// How long query results and terminal commands are retained
    pub result_ttl_secs: u64,
    /// Capacity of the failed-command ring
    pub failed_history: usize,
    /// Extra time a pending query may linger past its deadline before cleanup drops it
    pub orphan_grace_secs: u64,
    /// Sync silence after which the extension counts as disconnected
    pub disconnect_threshold_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_pending: 5,
            default_timeout_secs: 10,
            result_ttl_secs: 60,
            failed_history: 100,
            orphan_grace_secs: 10,
            disconnect_threshold_secs: 10,
        }
    }
}

impl QueryConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    #[must_use]
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    #[must_use]
    pub fn disconnect_threshold(&self) -> Duration {
        Duration::from_secs(self.disconnect_threshold_secs)
    }
}

impl BridgeConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(s).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&raw)
    }

    /// Default config location: `<config dir>/gasoline/gasoline.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gasoline").join("gasoline.toml"))
    }

    /// Load from an explicit path, or from the default location if present.
    ///
    /// A missing explicit path is an error; a missing default file is not.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => Ok(Self::default()),
        }
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Reject configurations that would make buffers or gates degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.buffers;
        let nonzero_counts = [
            ("buffers.max_ws_events", b.max_ws_events),
            ("buffers.max_network_bodies", b.max_network_bodies),
            ("buffers.max_enhanced_actions", b.max_enhanced_actions),
            ("buffers.max_extension_logs", b.max_extension_logs),
            ("buffers.default_ws_limit", b.default_ws_limit),
            ("buffers.default_body_limit", b.default_body_limit),
            ("connections.max_active", self.connections.max_active),
            ("connections.max_closed", self.connections.max_closed),
            ("queries.max_pending", self.queries.max_pending),
            ("queries.failed_history", self.queries.failed_history),
        ];
        for (name, value) in nonzero_counts {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        let nonzero_limits = [
            ("buffers.ws_memory_limit", b.ws_memory_limit),
            ("buffers.network_memory_limit", b.network_memory_limit),
            ("circuit.rate_threshold", self.circuit.rate_threshold),
            ("circuit.window_ms", self.circuit.window_ms),
            ("circuit.memory_hard_limit", self.circuit.memory_hard_limit),
            ("connections.rate_window_secs", self.connections.rate_window_secs),
            ("memory.soft_limit", self.memory.soft_limit),
        ];
        for (name, value) in nonzero_limits {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        if self.circuit.open_streak == 0 {
            return Err(ConfigError::ValidationError(
                "circuit.open_streak must be > 0".to_string(),
            ));
        }

        if self.circuit.memory_close_limit > self.circuit.memory_hard_limit {
            return Err(ConfigError::ValidationError(format!(
                "circuit.memory_close_limit ({}) must not exceed circuit.memory_hard_limit ({})",
                self.circuit.memory_close_limit, self.circuit.memory_hard_limit
            )));
        }

        // Directive strings (`gasoline_core=debug`) are checked at init time.
        let level = self.logging.level.trim();
        if !level.contains('=') {
            level.parse::<LogLevel>().map_err(ConfigError::ValidationError)?;
        }

        let m = &self.memory;
        if !(m.soft_limit <= m.hard_limit && m.hard_limit <= m.critical_limit) {
            return Err(ConfigError::ValidationError(format!(
                "memory tiers must satisfy soft <= hard <= critical (got {} / {} / {})",
                m.soft_limit, m.hard_limit, m.critical_limit
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    #[test]
    fn default_config_is_valid() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.buffers.max_ws_events, 500);
        assert_eq!(config.buffers.max_network_bodies, 100);
        assert_eq!(config.buffers.max_enhanced_actions, 50);
        assert_eq!(config.buffers.ws_memory_limit, 4 * MIB);
        assert_eq!(config.circuit.rate_threshold, 1000);
        assert_eq!(config.circuit.open_streak, 5);
        assert_eq!(config.queries.max_pending, 5);
        assert_eq!(config.connections.max_active, 20);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [circuit]
            rate_threshold = 50

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.circuit.rate_threshold, 50);
        assert_eq!(config.circuit.open_streak, 5);
        assert_eq!(config.buffers, BufferConfig::default());
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn toml_roundtrip() {
        let mut config = BridgeConfig::default();
        config.queries.default_timeout_secs = 30;
        config.buffers.ttl_secs = 120;
        let text = config.to_toml_string().unwrap();
        let parsed = BridgeConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = BridgeConfig::from_toml_str("[buffers\nmax_ws_events = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = BridgeConfig::default();
        config.buffers.max_network_bodies = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("buffers.max_network_bodies"));
    }

    #[test]
    fn validate_rejects_inverted_tiers() {
        let mut config = BridgeConfig::default();
        config.memory.soft_limit = config.memory.hard_limit + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn validate_rejects_close_limit_above_hard_limit() {
        let mut config = BridgeConfig::default();
        config.circuit.memory_close_limit = config.circuit.memory_hard_limit + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_checks_bare_log_level() {
        let mut config = BridgeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "WARNING".to_string();
        assert!(config.validate().is_ok());
        config.logging.level = "gasoline_core=debug,info".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gasoline.toml");
        std::fs::write(&path, "[queries]\nmax_pending = 8\n").unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.queries.max_pending, 8);
    }

    #[test]
    fn load_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = BridgeConfig::load_or_default(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn default_path_ends_with_gasoline_toml() {
        if let Some(path) = BridgeConfig::default_path() {
            assert!(path.ends_with("gasoline/gasoline.toml"));
        }
    }

    #[test]
    fn duration_helpers() {
        let config = BridgeConfig::default();
        assert_eq!(config.circuit.window(), Duration::from_secs(1));
        assert_eq!(config.circuit.close_after(), Duration::from_secs(10));
        assert_eq!(config.queries.disconnect_threshold(), Duration::from_secs(10));
        assert_eq!(config.connections.rate_window(), Duration::from_secs(5));
        assert_eq!(config.buffers.ttl(), None);
    }
}

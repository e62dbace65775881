//! gasoline-core: browser telemetry buffering and command bridge
//!
//! A browser extension streams WebSocket frames, network bodies, user actions
//! and its own diagnostic logs into bounded in-memory buffers. Control-plane
//! clients queue commands for the extension and wait for correlated results,
//! which the extension picks up and answers over a polling sync handshake.
//!
//! # Architecture
//!
//! ```text
//! extension ──▶ admit ──▶ Capture buffers ──▶ MemoryEnforcer
//!     ▲                        │                    │
//!     │                 ConnectionTracker     CircuitBreaker
//!     │
//!   sync ◀──────────────── QueryDispatcher ◀── control-plane clients
//! ```
//!
//! # Modules
//!
//! - `capture`: Composition root owning every buffer and component
//! - `sync`: Extension sync handshake (long-poll command delivery)
//! - `ring_buffer`: Count- and memory-bounded FIFO with monotonic totals
//! - `circuit_breaker`: Rate and memory admission control
//! - `memory_pressure`: Tiered eviction and minimal mode
//! - `connection_tracker`: Live WebSocket connection state and rates
//! - `query_dispatcher`: Pending queries, results and command correlation
//! - `commands`: Command status and result records
//! - `extension_state`: Extension liveness, settings and test boundaries
//! - `recording`: Recording sink boundary
//! - `health`: Aggregated health snapshot
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod capture;
pub mod circuit_breaker;
pub mod clock;
pub mod commands;
pub mod config;
pub mod connection_tracker;
pub mod error;
pub mod extension_state;
pub mod health;
pub mod logging;
pub mod memory_pressure;
pub mod query_dispatcher;
pub mod recording;
pub mod ring_buffer;
pub mod sync;
pub mod types;

pub use capture::{Capture, CaptureSnapshot};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use commands::{CommandResult, CommandStatus};
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use health::HealthSnapshot;
pub use query_dispatcher::{PendingQuery, QueryDispatcher};
pub use sync::{SyncRequest, SyncResponse};
pub use types::{LifecycleCallback, LifecycleEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for gasoline-core

use std::fmt::Write;
use thiserror::Error;

use crate::logging::LogError;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gasoline-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Query wait/lookup errors
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Ingestion rejected by the circuit breaker
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// Recording sink failures
    #[error("Recording error: {0}")]
    Recording(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Logging initialisation errors
    #[error("Logging error: {0}")]
    Logging(#[from] LogError),
}

impl Error {
    /// Return remediation guidance for this error.
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Config(err) => err.remediation(),
            Self::Query(err) => err.remediation(),
            Self::Admission(err) => err.remediation(),
            Self::Recording(_) => Remediation::new(
                "The recording sink rejected the request. Check that a recording is active and storage is writable.",
            )
            .alternative("Stop the active recording before starting a new one."),
            Self::Io(_) => Remediation::new("Check filesystem permissions and paths, then retry.")
                .alternative("Verify the state directory exists and is writable."),
            Self::Json(_) => Remediation::new("Validate the JSON input and retry.")
                .alternative("Check for trailing commas or invalid UTF-8."),
            Self::Logging(_) => Remediation::new(
                "Logging can only be initialised once per process with a valid level.",
            )
            .alternative("Use RUST_LOG to override the level instead of re-initialising."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Omit the path to fall back to the default location."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .alternative("Remove unknown sections; every key has a default."),
            Self::SerializeFailed(_) => {
                Remediation::new("Config could not be serialized. Report the offending value.")
            }
            Self::ValidationError(_) => Remediation::new(
                "Config values are out of range. Capacities and limits must be non-zero.",
            )
            .alternative("Memory tiers must satisfy soft <= hard <= critical."),
        }
    }
}

/// Errors from the pending-query result path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// No result arrived before the caller's deadline
    #[error("timeout waiting for result {id} after {waited_ms} ms")]
    Timeout { id: String, waited_ms: u64 },

    /// The query ID was never issued or its result was already consumed
    #[error("unknown query: {0}")]
    UnknownQuery(String),
}

impl QueryError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Timeout { waited_ms, .. } => Remediation::new(format!(
                "The browser extension did not answer within {waited_ms} ms. Check that it is connected and retry."
            ))
            .alternative("Raise the query timeout for slow pages."),
            Self::UnknownQuery(id) => Remediation::new(format!(
                "Query {id} is not known. Results are one-time reads and expire after the result TTL."
            )),
        }
    }
}

/// Ingestion rejected before touching any buffer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error(
        "rate limited: {current_rate} events in window exceeds {threshold} (circuit_open={circuit_open}); retry after {retry_after_ms} ms"
    )]
    RateLimited {
        retry_after_ms: u64,
        circuit_open: bool,
        current_rate: u64,
        threshold: u64,
    },
}

impl AdmissionError {
    /// Backoff hint for the producer.
    #[must_use]
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RateLimited {
                retry_after_ms,
                circuit_open,
                ..
            } => {
                let summary = if *circuit_open {
                    format!(
                        "Ingestion circuit is open. Back off for {retry_after_ms} ms; it closes after a sustained quiet period."
                    )
                } else {
                    format!("Event rate exceeds the per-second threshold. Retry after {retry_after_ms} ms.")
                };
                Remediation::new(summary)
                    .alternative("Batch events on the client or enable WebSocket sampling.")
            }
        }
    }
}

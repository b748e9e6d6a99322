//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence boundary exports and error type."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Persistence boundary for assembled bursts and cell snapshots.
//!
//! Items are dequeued from the handoff queue, filtered by the recording
//! predicate and written to a [`sink::RecordSink`]. A failing sink is dropped and
//! reopened lazily; items arriving while it is down are lost.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// The sink could not be opened or refused a write.
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
    /// The log on disk does not start with a record log header.
    #[error("not a record log: {0}")]
    BadHeader(String),
}

pub mod adapter;
pub mod event_log;
pub mod metrics;
pub mod sink;

pub use adapter::{Disposition, PersistenceAdapter};
pub use event_log::replay as replay_event_log;
pub use event_log::{EventLogEntry, EventLogReader, EventLogWriter, LOG_FORMAT_VERSION};
pub use metrics::PersistenceMetrics;
pub use sink::{EventLogConnector, EventLogSink, RecordSink, SinkConnector};

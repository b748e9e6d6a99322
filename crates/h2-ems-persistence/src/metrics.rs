//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Prometheus counters for the persistence adapter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::Result;

/// Counters published by the persistence adapter.
#[derive(Clone)]
pub struct PersistenceMetrics {
    persisted: IntCounterVec,
    dropped: IntCounterVec,
    sink_failures: IntCounter,
    bytes_written: IntCounter,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let persisted = IntCounterVec::new(
            Opts::new(
                "h2_ems_records_persisted_total",
                "Total number of bursts and snapshots written to the record sink",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(persisted.clone()))?;

        let dropped = IntCounterVec::new(
            Opts::new(
                "h2_ems_records_dropped_total",
                "Total number of dequeued items that were not persisted",
            ),
            &["kind", "reason"],
        )?;
        registry.register(Box::new(dropped.clone()))?;

        let sink_failures = IntCounter::new(
            "h2_ems_sink_failures_total",
            "Total number of record sink open or write failures",
        )?;
        registry.register(Box::new(sink_failures.clone()))?;

        let bytes_written = IntCounter::new(
            "h2_ems_record_log_bytes_total",
            "Total bytes appended to the record log",
        )?;
        registry.register(Box::new(bytes_written.clone()))?;

        Ok(Self {
            persisted,
            dropped,
            sink_failures,
            bytes_written,
            registry,
        })
    }

    /// Count one persisted item.
    pub fn record_persisted(&self, kind: &str, bytes: usize) {
        self.persisted.with_label_values(&[kind]).inc();
        self.bytes_written.inc_by(bytes as u64);
    }

    /// Count one item that was dequeued but not written.
    pub fn record_dropped(&self, kind: &str, reason: &str) {
        self.dropped.with_label_values(&[kind, reason]).inc();
    }

    /// Count a sink failure.
    pub fn record_sink_failure(&self) {
        self.sink_failures.inc();
    }

    /// Items persisted so far for `kind`.
    pub fn persisted(&self, kind: &str) -> u64 {
        self.persisted.with_label_values(&[kind]).get()
    }

    /// Items dropped so far for `kind` and `reason`.
    pub fn dropped(&self, kind: &str, reason: &str) -> u64 {
        self.dropped.with_label_values(&[kind, reason]).get()
    }

    /// Sink failures so far.
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.get()
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}

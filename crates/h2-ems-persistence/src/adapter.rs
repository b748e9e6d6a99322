//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Handoff queue consumer applying the recording predicate."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use h2_ems_cell::{ControlInputs, HandoffReceiver, PersistItem};
use h2_ems_common::SharedClock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::PersistenceMetrics;
use crate::sink::{RecordSink, SinkConnector};

/// What happened to one dequeued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Written to the sink.
    Persisted,
    /// Outside the recording predicate; dropped without buffering.
    Filtered,
    /// The sink was unavailable; the item is lost.
    Lost,
}

/// Single consumer of the handoff queue.
pub struct PersistenceAdapter {
    connector: Arc<dyn SinkConnector>,
    sink: Option<Box<dyn RecordSink>>,
    controls: Arc<ControlInputs>,
    metrics: Option<PersistenceMetrics>,
    clock: SharedClock,
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("target", &self.connector.describe())
            .field("connected", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl PersistenceAdapter {
    /// Build an adapter; the sink is opened on the first eligible item.
    pub fn new(
        connector: Arc<dyn SinkConnector>,
        controls: Arc<ControlInputs>,
        metrics: Option<PersistenceMetrics>,
        clock: SharedClock,
    ) -> Self {
        Self {
            connector,
            sink: None,
            controls,
            metrics,
            clock,
        }
    }

    /// Whether a sink connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    /// Filter and persist one item.
    pub fn process(&mut self, item: PersistItem) -> Disposition {
        let now = self.clock.now();
        let kind = item.kind();
        let permitted = match &item {
            PersistItem::Burst { activity, .. } => self.controls.permits_burst(activity, now),
            PersistItem::Snapshot { snapshot, .. } => self.controls.permits_snapshot(snapshot, now),
        };
        if !permitted {
            if let Some(metrics) = &self.metrics {
                metrics.record_dropped(kind, "not_eligible");
            }
            return Disposition::Filtered;
        }

        if self.sink.is_none() {
            match self.connector.connect() {
                Ok(sink) => {
                    info!(
                        target: "h2_ems::persistence",
                        sink = %self.connector.describe(),
                        "record sink connected"
                    );
                    self.sink = Some(sink);
                }
                Err(err) => {
                    warn!(
                        target: "h2_ems::persistence",
                        sink = %self.connector.describe(),
                        error = %err,
                        "record sink unavailable; item lost"
                    );
                    self.note_loss(kind);
                    return Disposition::Lost;
                }
            }
        }

        let Some(sink) = self.sink.as_mut() else {
            return Disposition::Lost;
        };
        match sink.write(&item, now) {
            Ok(bytes) => {
                debug!(target: "h2_ems::persistence", kind, bytes, "item persisted");
                if let Some(metrics) = &self.metrics {
                    metrics.record_persisted(kind, bytes);
                }
                Disposition::Persisted
            }
            Err(err) => {
                warn!(
                    target: "h2_ems::persistence",
                    error = %err,
                    "record sink write failed; dropping connection"
                );
                self.sink = None;
                self.note_loss(kind);
                Disposition::Lost
            }
        }
    }

    fn note_loss(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_sink_failure();
            metrics.record_dropped(kind, "sink_unavailable");
        }
    }

    /// Consume the queue until it closes or shutdown is signalled. Items already
    /// queued at shutdown are still processed.
    pub async fn run(mut self, mut queue: HandoffReceiver, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let mut drained = 0usize;
                    while let Some(item) = queue.try_next() {
                        self.process(item);
                        drained += 1;
                    }
                    debug!(
                        target: "h2_ems::persistence",
                        drained,
                        "persistence shutdown signal received"
                    );
                    break;
                }
                item = queue.next() => match item {
                    Some(item) => {
                        self.process(item);
                    }
                    None => break,
                }
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                warn!(target: "h2_ems::persistence", error = %err, "final flush failed");
            }
        }
    }
}

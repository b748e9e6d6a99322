//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus ingestion loop with cancellable reconnect."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The single task that owns the [`FrameDemultiplexer`]. Frames are applied in
//! arrival order; completed bursts and fault-edge snapshots go to the handoff
//! queue, blocking when it is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use h2_ems_cell::{
    BusConnector, CellRegistry, DeviceId, FaultTable, FrameDemultiplexer, FrameOutcome,
    FrameSource, HandoffSender, PersistItem, SnapshotReason, TelemetryRecord,
};
use h2_ems_common::SharedClock;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Running totals of the ingestion task.
#[derive(Debug, Default)]
pub struct IngestStats {
    frames: AtomicU64,
    decoded: AtomicU64,
    bursts: AtomicU64,
    dropped: AtomicU64,
    suppressed: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub frames: u64,
    pub decoded: u64,
    pub bursts: u64,
    pub dropped: u64,
    pub suppressed: u64,
    pub reconnects: u64,
}

impl IngestStats {
    pub fn counts(&self) -> IngestCounts {
        IngestCounts {
            frames: self.frames.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            bursts: self.bursts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record(&self, outcome: &FrameOutcome) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            FrameOutcome::Suppressed => &self.suppressed,
            FrameOutcome::Decoded { .. } => &self.decoded,
            FrameOutcome::BurstComplete(_) => &self.bursts,
            FrameOutcome::Dropped => &self.dropped,
            FrameOutcome::BurstPending => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct IngestTask {
    pub connector: Arc<dyn BusConnector>,
    pub demux: FrameDemultiplexer,
    pub handoff: Option<HandoffSender>,
    pub table: Arc<FaultTable>,
    pub clock: SharedClock,
    pub heartbeat_window: Duration,
    pub reconnect_delay: Duration,
    pub stats: Arc<IngestStats>,
    /// Flipped to true once a finite source is exhausted.
    pub finished: watch::Sender<bool>,
}

enum StreamEnd {
    Shutdown,
    Exhausted,
    Disconnected,
}

impl IngestTask {
    fn registry(&self) -> Arc<CellRegistry> {
        Arc::clone(self.demux.registry())
    }

    /// Connect, read until the source ends or fails, and reconnect after a fixed
    /// delay. Returns on shutdown or when a finite source is exhausted.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let target = self.connector.describe();
        loop {
            let connected = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                connected = self.connector.connect() => connected,
            };
            match connected {
                Ok(source) => {
                    info!(target: "h2_ems::ingest", bus = %target, "bus adapter connected");
                    match self.pump(source, &mut shutdown).await {
                        StreamEnd::Shutdown => return Ok(()),
                        StreamEnd::Exhausted => {
                            info!(
                                target: "h2_ems::ingest",
                                bus = %target,
                                counts = ?self.stats.counts(),
                                "frame source exhausted"
                            );
                            self.finished.send_replace(true);
                            return Ok(());
                        }
                        StreamEnd::Disconnected => {}
                    }
                }
                Err(err) => {
                    warn!(
                        target: "h2_ems::ingest",
                        bus = %target,
                        error = %err,
                        "bus adapter connect failed"
                    );
                }
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "h2_ems::ingest",
                bus = %target,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "reconnecting to bus adapter"
            );
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn pump(
        &mut self,
        mut source: Box<dyn FrameSource>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => return StreamEnd::Shutdown,
                next = source.next_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    let outcome = self.demux.handle(&frame);
                    self.stats.record(&outcome);
                    self.dispatch(outcome).await;
                }
                Ok(None) => return StreamEnd::Exhausted,
                Err(err) => {
                    warn!(target: "h2_ems::ingest", error = %err, "bus adapter disconnected");
                    return StreamEnd::Disconnected;
                }
            }
        }
    }

    async fn dispatch(&self, outcome: FrameOutcome) {
        if let Some(device) = outcome.fault_raised() {
            self.dump_snapshot(device).await;
        }
        if let FrameOutcome::BurstComplete(record) = outcome {
            self.hand_off_burst(record).await;
        }
    }

    async fn hand_off_burst(&self, record: TelemetryRecord) {
        debug!(
            target: "h2_ems::ingest",
            sequence = record.sequence,
            entries = record.entries.len(),
            "telemetry burst complete"
        );
        let activity = self
            .registry()
            .activity(self.clock.now(), self.heartbeat_window);
        self.push(PersistItem::Burst { record, activity }).await;
    }

    async fn dump_snapshot(&self, device: DeviceId) {
        let Some(handle) = self.registry().get(device) else {
            return;
        };
        let snapshot = handle.snapshot(&self.table, self.clock.now(), self.heartbeat_window);
        warn!(
            target: "h2_ems::ingest",
            %device,
            severity = ?snapshot.severity,
            reboot_required = snapshot.reboot_required,
            "fault raised; dumping telemetry"
        );
        self.push(PersistItem::Snapshot {
            snapshot,
            reason: SnapshotReason::FaultRaised,
        })
        .await;
    }

    async fn push(&self, item: PersistItem) {
        let Some(handoff) = &self.handoff else {
            return;
        };
        if handoff.capacity_left() == 0 {
            debug!(
                target: "h2_ems::ingest",
                kind = item.kind(),
                "handoff queue full; ingestion waiting"
            );
        }
        if handoff.push(item).await.is_err() {
            debug!(target: "h2_ems::ingest", "handoff queue closed; item discarded");
        }
    }
}

//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bounded handoff queue toward persistence."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The queue is bounded and `push` waits for room: a persistence consumer that
//! falls behind stalls ingestion instead of growing memory. Size the capacity
//! generously (`bus.handoff_capacity`) to ride out short sink stalls.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::assembler::TelemetryRecord;
use crate::control::DeviceActivity;
use crate::error::HandoffClosed;
use crate::frame::DeviceId;
use crate::state::CellSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    Periodic,
    /// The module's fault bit just rose.
    FaultRaised,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistItem {
    Burst {
        record: TelemetryRecord,
        /// Device liveness when the burst completed.
        activity: Vec<DeviceActivity>,
    },
    Snapshot {
        snapshot: CellSnapshot,
        reason: SnapshotReason,
    },
}

impl PersistItem {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistItem::Burst { .. } => "burst",
            PersistItem::Snapshot { .. } => "snapshot",
        }
    }

    /// Owning module; bursts are bus-global and have none.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            PersistItem::Burst { .. } => None,
            PersistItem::Snapshot { snapshot, .. } => Some(snapshot.device),
        }
    }
}

pub fn handoff_channel(capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (HandoffSender { tx }, HandoffReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: mpsc::Sender<PersistItem>,
}

impl HandoffSender {
    /// Enqueue, waiting while the queue is full.
    pub async fn push(&self, item: PersistItem) -> Result<(), HandoffClosed> {
        self.tx.send(item).await.map_err(|_| HandoffClosed)
    }

    pub fn capacity_left(&self) -> usize {
        self.tx.capacity()
    }
}

/// Single consumer end of the handoff queue.
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: mpsc::Receiver<PersistItem>,
}

impl HandoffReceiver {
    pub async fn next(&mut self) -> Option<PersistItem> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<PersistItem> {
        self.rx.try_recv().ok()
    }
}

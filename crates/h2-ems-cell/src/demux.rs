//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Frame routing, cell registry and bus idle watchdog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use h2_ems_common::elapsed_since;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::assembler::{TelemetryAssembler, TelemetryRecord};
use crate::control::{ControlInputs, DeviceActivity};
use crate::decoder::{self, DecodeOutcome};
use crate::fault::FaultTable;
use crate::frame::{DeviceId, RawFrame};
use crate::state::{CellHandle, CellSnapshot};

/// All cells seen on the bus. Cells are created on first sighting and live for
/// the rest of the process. The map lock is only held to find a handle.
#[derive(Debug, Default)]
pub struct CellRegistry {
    cells: RwLock<BTreeMap<DeviceId, Arc<CellHandle>>>,
}

impl CellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: DeviceId) -> Option<Arc<CellHandle>> {
        self.cells.read().get(&device).cloned()
    }

    pub fn get_or_create(&self, device: DeviceId) -> Arc<CellHandle> {
        if let Some(handle) = self.get(device) {
            return handle;
        }
        self.cells
            .write()
            .entry(device)
            .or_insert_with(|| {
                info!(target: "h2_ems::demux", %device, "new fuel-cell module on bus");
                Arc::new(CellHandle::new(device))
            })
            .clone()
    }

    /// Handles ordered by device id.
    pub fn handles(&self) -> Vec<Arc<CellHandle>> {
        self.cells.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    pub fn snapshots(
        &self,
        table: &FaultTable,
        now: DateTime<Utc>,
        heartbeat_window: Duration,
    ) -> Vec<CellSnapshot> {
        self.handles()
            .iter()
            .map(|handle| handle.snapshot(table, now, heartbeat_window))
            .collect()
    }

    pub fn activity(&self, now: DateTime<Utc>, heartbeat_window: Duration) -> Vec<DeviceActivity> {
        self.handles()
            .iter()
            .map(|handle| {
                let state = handle.state_copy();
                DeviceActivity {
                    device: handle.device(),
                    switched_on: state.is_switched_on(now, heartbeat_window),
                    running: state.status.contains(crate::state::StatusFlags::RUN),
                }
            })
            .collect()
    }

    pub fn clear_all_telemetry(&self) {
        for handle in self.handles() {
            handle.with_state(|state| state.clear_telemetry());
        }
    }
}

/// Clears every cell's telemetry once the bus has been silent for `timeout`.
/// Driven by an external poll so tests can supply their own clock readings.
#[derive(Debug)]
pub struct IdleWatchdog {
    registry: Arc<CellRegistry>,
    timeout: Duration,
    inner: Mutex<WatchdogState>,
}

#[derive(Debug, Default)]
struct WatchdogState {
    last_activity: Option<DateTime<Utc>>,
    fired: bool,
}

impl IdleWatchdog {
    pub fn new(registry: Arc<CellRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            inner: Mutex::new(WatchdogState::default()),
        }
    }

    /// Reset the silence timer.
    pub fn kick(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.last_activity = Some(now);
        inner.fired = false;
    }

    /// Returns true when this call cleared telemetry. Fires once per silence.
    pub fn poll(&self, now: DateTime<Utc>) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(last) = inner.last_activity else {
                return false;
            };
            if inner.fired || elapsed_since(now, last) < self.timeout {
                return false;
            }
            inner.fired = true;
        }
        warn!(
            target: "h2_ems::demux",
            timeout_ms = self.timeout.as_millis() as u64,
            cells = self.registry.len(),
            "bus silent; clearing cell telemetry"
        );
        self.registry.clear_all_telemetry();
        true
    }
}

/// What the ingestion loop should do after one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Maintenance suppression is active.
    Suppressed,
    Decoded {
        device: DeviceId,
        outcome: DecodeOutcome,
    },
    /// Burst sub-frame accepted; record still incomplete.
    BurstPending,
    BurstComplete(TelemetryRecord),
    /// Frame was malformed and has been logged.
    Dropped,
}

impl FrameOutcome {
    /// Device whose fault bit just rose, signalling an immediate telemetry dump.
    pub fn fault_raised(&self) -> Option<DeviceId> {
        match self {
            FrameOutcome::Decoded {
                device,
                outcome: DecodeOutcome::State { fault_raised: true },
            } => Some(*device),
            _ => None,
        }
    }
}

/// Routes frames to the burst assembler or to per-device decoders. Frames are
/// processed strictly in arrival order by a single owner.
#[derive(Debug)]
pub struct FrameDemultiplexer {
    registry: Arc<CellRegistry>,
    controls: Arc<ControlInputs>,
    watchdog: Arc<IdleWatchdog>,
    assembler: TelemetryAssembler,
}

impl FrameDemultiplexer {
    pub fn new(
        registry: Arc<CellRegistry>,
        controls: Arc<ControlInputs>,
        watchdog: Arc<IdleWatchdog>,
    ) -> Self {
        Self {
            registry,
            controls,
            watchdog,
            assembler: TelemetryAssembler::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CellRegistry> {
        &self.registry
    }

    pub fn handle(&mut self, frame: &RawFrame) -> FrameOutcome {
        if self.controls.maintenance() {
            return FrameOutcome::Suppressed;
        }

        if frame.is_burst() {
            return match self.assembler.accept(frame.payload(), frame.received_at) {
                Ok(Some(record)) => FrameOutcome::BurstComplete(record),
                Ok(None) => FrameOutcome::BurstPending,
                Err(err) => {
                    warn!(target: "h2_ems::assembler", error = %err, "dropping burst sub-frame");
                    FrameOutcome::Dropped
                }
            };
        }

        self.watchdog.kick(frame.received_at);
        let device = frame.device();
        let family = frame.family();
        let handle = self.registry.get_or_create(device);
        let result = handle.with_state(|state| {
            state.touch(frame.received_at);
            decoder::decode(state, family, frame.payload(), frame.received_at)
        });

        match result {
            Ok(outcome) => {
                if let DecodeOutcome::FaultRegisters { changed: true } = outcome {
                    debug!(
                        target: "h2_ems::decoder",
                        %device,
                        family = %format!("{family:#05x}"),
                        "fault registers changed"
                    );
                }
                FrameOutcome::Decoded { device, outcome }
            }
            Err(err) => {
                warn!(target: "h2_ems::decoder", %device, error = %err, "dropping frame");
                FrameOutcome::Dropped
            }
        }
    }
}

//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator control inputs: maintenance suppression and recording eligibility."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use h2_ems_common::{DeviceLogPolicy, RecordingConfig};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::frame::DeviceId;
use crate::state::CellSnapshot;

/// Operator-requested interval during which everything is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RecordingWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

/// Liveness of one device at the moment a burst was handed off. Bursts are
/// bus-global, so eligibility is judged against every known device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceActivity {
    pub device: DeviceId,
    pub switched_on: bool,
    pub running: bool,
}

impl From<&CellSnapshot> for DeviceActivity {
    fn from(snapshot: &CellSnapshot) -> Self {
        Self {
            device: snapshot.device,
            switched_on: snapshot.switched_on,
            running: snapshot.flags.run,
        }
    }
}

/// Externally controlled switches read by the ingestion and persistence paths.
#[derive(Debug, Default)]
pub struct ControlInputs {
    maintenance: AtomicBool,
    window: RwLock<Option<RecordingWindow>>,
    default_policy: RwLock<DeviceLogPolicy>,
    overrides: RwLock<HashMap<DeviceId, DeviceLogPolicy>>,
}

impl ControlInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RecordingConfig) -> Self {
        let inputs = Self::new();
        if let Some(window) = config.window {
            inputs.open_window(window.start, window.end);
        }
        *inputs.default_policy.write() = config.default_policy;
        for entry in &config.devices {
            inputs.set_policy(DeviceId::new(entry.device), entry.policy);
        }
        inputs
    }

    pub fn maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, enabled: bool) {
        let previous = self.maintenance.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(target: "h2_ems::control", enabled, "maintenance suppression toggled");
        }
    }

    pub fn open_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        info!(target: "h2_ems::control", %start, %end, "recording window set");
        *self.window.write() = Some(RecordingWindow { start, end });
    }

    pub fn close_window(&self) {
        *self.window.write() = None;
    }

    pub fn window(&self) -> Option<RecordingWindow> {
        *self.window.read()
    }

    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        self.window().map(|w| w.contains(now)).unwrap_or(false)
    }

    pub fn set_policy(&self, device: DeviceId, policy: DeviceLogPolicy) {
        self.overrides.write().insert(device, policy);
    }

    pub fn policy_for(&self, device: DeviceId) -> DeviceLogPolicy {
        self.overrides
            .read()
            .get(&device)
            .copied()
            .unwrap_or_else(|| *self.default_policy.read())
    }

    fn policy_admits(&self, activity: &DeviceActivity) -> bool {
        let policy = self.policy_for(activity.device);
        (policy.log_on_enable && activity.switched_on) || (policy.log_on_run && activity.running)
    }

    /// Persistence predicate for a periodic cell snapshot.
    pub fn permits_snapshot(&self, snapshot: &CellSnapshot, now: DateTime<Utc>) -> bool {
        self.window_open(now) || self.policy_admits(&DeviceActivity::from(snapshot))
    }

    /// Persistence predicate for a bus-global burst record.
    pub fn permits_burst(&self, activity: &[DeviceActivity], now: DateTime<Utc>) -> bool {
        self.window_open(now) || activity.iter().any(|a| self.policy_admits(a))
    }
}

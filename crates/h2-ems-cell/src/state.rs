//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-module cell state and snapshot accessor."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use h2_ems_common::elapsed_since;
use parking_lot::Mutex;
use serde::Serialize;

use crate::fault::{FaultDescriptions, FaultRegisters, FaultTable, Severity};
use crate::frame::DeviceId;

/// Bytes in the assembled serial number buffer.
pub const SERIAL_LEN: usize = 16;

bitflags! {
    /// Operating state, first byte of the state frame.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u8 {
        const INACTIVE = 1 << 0;
        const RUN = 1 << 1;
        const STANDBY = 1 << 2;
        const FAULT = 1 << 3;
    }
}

bitflags! {
    /// Load-logic bits, second byte of the state frame.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct LoadFlags: u8 {
        const LOGIC_DISABLED = 1 << 0;
        const ON_LOAD = 1 << 1;
        const FAN_PULSE = 1 << 2;
        const DERATED = 1 << 3;
    }
}

bitflags! {
    /// Six digital outputs, third byte of the state frame.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct OutputFlags: u8 {
        const OUT0 = 1 << 0;
        const OUT1 = 1 << 1;
        const OUT2 = 1 << 2;
        const OUT3 = 1 << 3;
        const OUT4 = 1 << 4;
        const OUT5 = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Raw telemetry registers as they arrive on the bus. Scaling happens in
/// [`CellSnapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub run_hours: u32,
    pub energy_wh: u64,
    pub power_w: i16,
    pub volts_centi: u16,
    pub current_centi: i16,
    pub anode_pressure_mbar: u16,
    pub outlet_temp_deci: i16,
    pub inlet_temp_deci: i16,
    pub dcdc_setpoint_centi: u16,
    pub dcdc_limit_centi: u16,
    pub louver_pct: u16,
    pub fan_duty_pct: u16,
}

/// Auto-recovery bookkeeping. Survives telemetry clears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryBook {
    pub fault_time: Option<DateTime<Utc>>,
    pub clear_time: Option<DateTime<Utc>>,
    pub in_restart: bool,
    pub restart_attempts: u32,
}

impl RecoveryBook {
    /// An episode is open while a fault is being timed or attempts are unresolved.
    pub fn episode_open(&self) -> bool {
        self.fault_time.is_some() || self.restart_attempts > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CellState {
    pub serial: [u8; SERIAL_LEN],
    pub version: Option<FirmwareVersion>,
    pub telemetry: Telemetry,
    pub faults: FaultRegisters,
    pub status: StatusFlags,
    pub load: LoadFlags,
    pub outputs: OutputFlags,
    pub last_update: Option<DateTime<Utc>>,
    pub recovery: RecoveryBook,
}

impl CellState {
    pub fn fault_active(&self) -> bool {
        self.status.contains(StatusFlags::FAULT)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = Some(now);
    }

    /// `now - last_update < window`; a cell never heard from is off.
    pub fn is_switched_on(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_update
            .map(|seen| elapsed_since(now, seen) < window)
            .unwrap_or(false)
    }

    pub fn serial_string(&self) -> String {
        self.serial
            .iter()
            .filter(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect()
    }

    /// Reset everything the bus reports live. Identity, heartbeat and recovery
    /// bookkeeping are kept.
    pub fn clear_telemetry(&mut self) {
        self.telemetry = Telemetry::default();
        self.faults = FaultRegisters::default();
        self.status = StatusFlags::empty();
        self.load = LoadFlags::empty();
        self.outputs = OutputFlags::empty();
    }
}

/// Shared handle to one module's state. All access goes through one lock.
#[derive(Debug)]
pub struct CellHandle {
    device: DeviceId,
    state: Mutex<CellState>,
}

impl CellHandle {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            state: Mutex::new(CellState::default()),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Run `f` with exclusive access. Keep the closure short; the ingestion path
    /// contends on the same lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CellState) -> R) -> R {
        let mut guard = self.state.lock();
        f(&mut guard)
    }

    /// Copy the state under a single lock acquisition.
    pub fn state_copy(&self) -> CellState {
        self.state.lock().clone()
    }

    pub fn snapshot(
        &self,
        table: &FaultTable,
        now: DateTime<Utc>,
        heartbeat_window: Duration,
    ) -> CellSnapshot {
        let state = self.state_copy();
        CellSnapshot::from_state(self.device, &state, table, now, heartbeat_window)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    pub inactive: bool,
    pub run: bool,
    pub standby: bool,
    pub fault: bool,
    pub load_logic_disabled: bool,
    pub on_load: bool,
    pub fan_pulse: bool,
    pub derated: bool,
    pub outputs: [bool; 6],
}

impl FlagSnapshot {
    fn from_state(state: &CellState) -> Self {
        let mut outputs = [false; 6];
        for (bit, slot) in outputs.iter_mut().enumerate() {
            *slot = state.outputs.bits() & (1 << bit) != 0;
        }
        Self {
            inactive: state.status.contains(StatusFlags::INACTIVE),
            run: state.status.contains(StatusFlags::RUN),
            standby: state.status.contains(StatusFlags::STANDBY),
            fault: state.status.contains(StatusFlags::FAULT),
            load_logic_disabled: state.load.contains(LoadFlags::LOGIC_DISABLED),
            on_load: state.load.contains(LoadFlags::ON_LOAD),
            fan_pulse: state.load.contains(LoadFlags::FAN_PULSE),
            derated: state.load.contains(LoadFlags::DERATED),
            outputs,
        }
    }
}

/// Immutable, consistent view of one module in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellSnapshot {
    pub device: DeviceId,
    pub taken_at: DateTime<Utc>,
    pub serial: String,
    pub version: Option<FirmwareVersion>,
    pub switched_on: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub run_hours: u32,
    pub energy_wh: u64,
    pub power_w: f64,
    pub volts: f64,
    pub current_a: f64,
    pub anode_pressure_mbar: f64,
    pub outlet_temp_c: f64,
    pub inlet_temp_c: f64,
    pub dcdc_setpoint_v: f64,
    pub dcdc_limit_a: f64,
    pub louver_pct: f64,
    pub fan_duty_pct: f64,
    pub flags: FlagSnapshot,
    pub faults: FaultRegisters,
    pub severity: Severity,
    pub reboot_required: bool,
    pub fault_descriptions: FaultDescriptions,
    pub recovery: RecoveryBook,
}

impl CellSnapshot {
    pub fn from_state(
        device: DeviceId,
        state: &CellState,
        table: &FaultTable,
        now: DateTime<Utc>,
        heartbeat_window: Duration,
    ) -> Self {
        let t = &state.telemetry;
        let assessment = table.resolve(&state.faults);
        Self {
            device,
            taken_at: now,
            serial: state.serial_string(),
            version: state.version,
            switched_on: state.is_switched_on(now, heartbeat_window),
            last_update: state.last_update,
            run_hours: t.run_hours,
            energy_wh: t.energy_wh,
            power_w: f64::from(t.power_w),
            volts: f64::from(t.volts_centi) * 0.01,
            current_a: f64::from(t.current_centi) * 0.01,
            anode_pressure_mbar: f64::from(t.anode_pressure_mbar),
            outlet_temp_c: f64::from(t.outlet_temp_deci) * 0.1,
            inlet_temp_c: f64::from(t.inlet_temp_deci) * 0.1,
            dcdc_setpoint_v: f64::from(t.dcdc_setpoint_centi) * 0.01,
            dcdc_limit_a: f64::from(t.dcdc_limit_centi) * 0.01,
            louver_pct: f64::from(t.louver_pct),
            fan_duty_pct: f64::from(t.fan_duty_pct),
            flags: FlagSnapshot::from_state(state),
            faults: state.faults,
            severity: assessment.severity,
            reboot_required: assessment.reboot_required,
            fault_descriptions: table.describe(&state.faults),
            recovery: state.recovery,
        }
    }
}

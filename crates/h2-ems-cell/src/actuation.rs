//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Power actuation contract used by auto-recovery."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::error::ActuationError;
use crate::frame::DeviceId;

/// Operator intent captured before a power cycle and restored on power-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerIntent {
    pub enabled: bool,
    pub run: bool,
}

impl Default for PowerIntent {
    fn default() -> Self {
        Self {
            enabled: true,
            run: true,
        }
    }
}

/// Relay-side control of one fuel-cell module. Implemented by the register-bus
/// layer in a full installation.
#[async_trait]
pub trait ModuleControl: Send + Sync {
    /// Current enable/run intent for the module.
    async fn intent(&self, device: DeviceId) -> PowerIntent;

    async fn power_off(&self, device: DeviceId) -> Result<(), ActuationError>;

    async fn power_on(&self, device: DeviceId, intent: PowerIntent) -> Result<(), ActuationError>;
}

/// Control adapter for installations without a relay bus: logs every command and
/// remembers the last intent per module.
#[derive(Debug, Default)]
pub struct LoggingModuleControl {
    intents: Mutex<HashMap<DeviceId, PowerIntent>>,
}

impl LoggingModuleControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_intent(&self, device: DeviceId, intent: PowerIntent) {
        self.intents.lock().insert(device, intent);
    }
}

#[async_trait]
impl ModuleControl for LoggingModuleControl {
    async fn intent(&self, device: DeviceId) -> PowerIntent {
        self.intents.lock().get(&device).copied().unwrap_or_default()
    }

    async fn power_off(&self, device: DeviceId) -> Result<(), ActuationError> {
        info!(target: "h2_ems::actuation", %device, "power off requested");
        Ok(())
    }

    async fn power_on(&self, device: DeviceId, intent: PowerIntent) -> Result<(), ActuationError> {
        info!(
            target: "h2_ems::actuation",
            %device,
            enabled = intent.enabled,
            run = intent.run,
            "power on requested"
        );
        self.set_intent(device, intent);
        Ok(())
    }
}

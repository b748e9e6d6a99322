//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator notification contract for restart attempts."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::NotifyError;
use crate::fault::{FaultDescriptions, Severity};
use crate::frame::DeviceId;

/// Sent on every restart attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartNotice {
    pub device: DeviceId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub severity: Severity,
    pub faults: FaultDescriptions,
    pub issued_at: DateTime<Utc>,
}

/// Delivery of restart notices. The transport (mail, SMS, ...) lives outside
/// the core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &RestartNotice) -> Result<(), NotifyError>;
}

/// Writes notices to the log at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: &RestartNotice) -> Result<(), NotifyError> {
        let faults = notice
            .faults
            .iter()
            .filter(|(_, lines)| !lines.is_empty())
            .map(|(bank, lines)| format!("{bank}: {}", lines.join("; ")))
            .collect::<Vec<_>>()
            .join(" | ");
        warn!(
            target: "h2_ems::notify",
            device = %notice.device,
            attempt = notice.attempt,
            max_attempts = notice.max_attempts,
            severity = %notice.severity,
            faults = %faults,
            "fuel-cell module restart"
        );
        Ok(())
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration, logging and clock primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the H2-EMS supervisor workspace.
//! This crate exposes configuration loading, logging, and the injectable
//! clock consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, BusConfig, DeviceLogOverride, DeviceLogPolicy, FaultTableConfig, LoggingConfig,
    PersistenceConfig, RecordingConfig, RecordingWindowConfig, RecoveryConfig, TelemetryConfig,
    MAX_DEVICE_ID,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{elapsed_since, Clock, ManualClock, SharedClock, SystemClock};

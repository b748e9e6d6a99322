//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fuel-cell bus ingestion, fault resolution and auto-recovery."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Frames flow `transport -> demux -> {assembler | decoder}`; the recovery sweep
//! and the persistence handoff read cell state through [`CellHandle::snapshot`].

pub mod actuation;
pub mod assembler;
pub mod control;
pub mod decoder;
pub mod demux;
pub mod error;
pub mod fault;
pub mod frame;
pub mod handoff;
pub mod notify;
pub mod recovery;
pub mod state;
pub mod transport;

pub use actuation::{LoggingModuleControl, ModuleControl, PowerIntent};
pub use assembler::{BurstEntry, TelemetryAssembler, TelemetryRecord};
pub use control::{ControlInputs, DeviceActivity, RecordingWindow};
pub use decoder::{decode, DecodeOutcome};
pub use demux::{CellRegistry, FrameDemultiplexer, FrameOutcome, IdleWatchdog};
pub use error::{
    ActuationError, AssemblyError, DecodeError, FaultTableError, FrameError, HandoffClosed,
    NotifyError, TransportError,
};
pub use fault::{
    FaultAssessment, FaultBank, FaultDefinition, FaultDescriptions, FaultRegisters, FaultTable,
    Severity,
};
pub use frame::{family, DeviceId, RawFrame};
pub use handoff::{handoff_channel, HandoffReceiver, HandoffSender, PersistItem, SnapshotReason};
pub use notify::{Notifier, RestartNotice, TracingNotifier};
pub use recovery::{
    evaluate, RecoveryDecision, RecoveryMonitor, RecoveryPhase, RecoveryPolicy, RestartAction,
    RestartTimers,
};
pub use state::{CellHandle, CellSnapshot, CellState, RecoveryBook};
pub use transport::{BusConnector, ChannelConnector, ChannelSource, FrameSource};

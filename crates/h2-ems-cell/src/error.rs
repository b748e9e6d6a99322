//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for the fuel-cell bus core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame {identifier:#05x} carries {len} payload bytes (max 8)")]
    PayloadTooLong { identifier: u32, len: usize },
}

/// Reasons a cell frame could not be applied to its state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("family {family:#05x} needs {expected} payload bytes, got {actual}")]
    ShortPayload {
        family: u32,
        expected: usize,
        actual: usize,
    },

    #[error("unknown frame family {0:#05x}")]
    UnknownFamily(u32),
}

/// Reasons a burst sub-frame was dropped. None of these disturb the record in flight.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("burst sub-frame needs 8 payload bytes, got {0}")]
    ShortSubFrame(usize),

    #[error("burst sub-frame index {0:#04x} outside 0x00..=0x2e")]
    IndexOutOfRange(u8),

    #[error("burst sub-frame index {0:#04x} arrived with no burst in flight")]
    Orphan(u8),
}

#[derive(Debug, Error)]
pub enum FaultTableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unsupported fault table format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid fault row bank={bank:?} bit={bit}: {reason}")]
    InvalidRow {
        bank: String,
        bit: u32,
        reason: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bus adapter unavailable: {0}")]
    Unavailable(String),

    #[error("bus adapter disconnected")]
    Disconnected,

    #[error("malformed frame from adapter: {0}")]
    Frame(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("module {device} did not acknowledge {command}")]
    NotAcknowledged { device: String, command: &'static str },

    #[error("actuation channel unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("persistence handoff queue closed")]
pub struct HandoffClosed;

//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fuel-cell bus frame model and identifier layout."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Maximum payload carried by one bus frame.
pub const MAX_PAYLOAD: usize = 8;

/// Identifier bits selecting the physical module.
pub const DEVICE_MASK: u32 = 0x7;

/// Frame families understood by the cell decoder. The low three identifier bits
/// carry the device id and are masked off before comparison.
pub mod family {
    pub const SERIAL: u32 = 0x100;
    pub const VERSION: u32 = 0x108;
    pub const RUN_HOURS: u32 = 0x110;
    pub const FAULTS_AB: u32 = 0x118;
    pub const ELECTRICAL: u32 = 0x120;
    pub const THERMAL: u32 = 0x128;
    pub const ACTUATOR: u32 = 0x130;
    pub const STATE: u32 = 0x138;
    pub const FAULTS_CD: u32 = 0x140;
    /// Bus-global multi-frame telemetry burst.
    pub const TELEMETRY_BURST: u32 = 0x3C0;
}

/// Physical fuel-cell module address (low three identifier bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(u8);

impl DeviceId {
    pub fn new(raw: u8) -> Self {
        Self(raw & DEVICE_MASK as u8)
    }

    pub fn from_identifier(identifier: u32) -> Self {
        Self((identifier & DEVICE_MASK) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fc{}", self.0)
    }
}

/// One frame as received from the bus adapter. Consumed once by the demultiplexer.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub identifier: u32,
    data: [u8; MAX_PAYLOAD],
    len: u8,
    pub received_at: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(
        identifier: u32,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong {
                identifier,
                len: payload.len(),
            });
        }
        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            identifier,
            data,
            len: payload.len() as u8,
            received_at,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn device(&self) -> DeviceId {
        DeviceId::from_identifier(self.identifier)
    }

    /// Identifier with the device bits masked off.
    pub fn family(&self) -> u32 {
        self.identifier & !DEVICE_MASK
    }

    pub fn is_burst(&self) -> bool {
        self.family() == family::TELEMETRY_BURST
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("identifier", &format_args!("{:#05x}", self.identifier))
            .field("payload", &hex::encode(self.payload()))
            .field("received_at", &self.received_at)
            .finish()
    }
}

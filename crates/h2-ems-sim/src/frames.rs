//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Capture frame model and synthetic fuel-cell frame builders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use h2_ems_cell::assembler::LAST_INDEX;
use h2_ems_cell::state::{LoadFlags, OutputFlags, StatusFlags};
use h2_ems_cell::{family, FrameError, RawFrame};
use serde::{Deserialize, Serialize};

/// One captured bus frame, positioned by its offset from the capture start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFrame {
    pub offset_ms: u64,
    pub identifier: u32,
    pub data: Vec<u8>,
}

impl CaptureFrame {
    pub fn new(offset_ms: u64, identifier: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            offset_ms,
            identifier,
            data: data.into(),
        }
    }

    /// Materialise as a bus frame received at `base + offset`.
    pub fn to_raw(&self, base: DateTime<Utc>) -> Result<RawFrame, FrameError> {
        self.to_raw_at(base + Duration::milliseconds(self.offset_ms as i64))
    }

    pub fn to_raw_at(&self, received_at: DateTime<Utc>) -> Result<RawFrame, FrameError> {
        RawFrame::new(self.identifier, &self.data, received_at)
    }
}

/// On-disk capture row: `offset_ms,id,data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CaptureRecord {
    pub offset_ms: u64,
    pub id: String,
    #[serde(default)]
    pub data: String,
}

impl CaptureRecord {
    pub(crate) fn parse(&self) -> Result<CaptureFrame> {
        let id = self.id.trim();
        let identifier = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
            Some(hex_id) => u32::from_str_radix(hex_id, 16),
            None => id.parse::<u32>(),
        }
        .with_context(|| format!("invalid frame identifier {:?}", self.id))?;
        let data = hex::decode(self.data.trim().replace(' ', ""))
            .with_context(|| format!("invalid payload hex {:?}", self.data))?;
        if data.len() > h2_ems_cell::frame::MAX_PAYLOAD {
            return Err(anyhow!(
                "payload of {} bytes exceeds bus frame size",
                data.len()
            ));
        }
        Ok(CaptureFrame::new(self.offset_ms, identifier, data))
    }
}

impl From<&CaptureFrame> for CaptureRecord {
    fn from(frame: &CaptureFrame) -> Self {
        Self {
            offset_ms: frame.offset_ms,
            id: format!("{:#05x}", frame.identifier),
            data: hex::encode(&frame.data),
        }
    }
}

/// Builds well-formed frames for one fuel-cell module.
#[derive(Debug, Clone, Copy)]
pub struct FrameBuilder {
    device: u8,
    offset_ms: u64,
}

impl FrameBuilder {
    pub fn new(device: u8) -> Self {
        Self {
            device: device & 0x7,
            offset_ms: 0,
        }
    }

    /// Builder whose frames are stamped at `offset_ms`.
    pub fn at(self, offset_ms: u64) -> Self {
        Self { offset_ms, ..self }
    }

    fn frame(&self, family_id: u32, data: impl Into<Vec<u8>>) -> CaptureFrame {
        CaptureFrame::new(self.offset_ms, family_id | u32::from(self.device), data)
    }

    /// Both serial half-frames. Characters beyond 14 are truncated.
    pub fn serial(&self, serial: &str) -> [CaptureFrame; 2] {
        let bytes = serial.as_bytes();
        let half = |marker: u8, range: std::ops::Range<usize>| {
            let mut data = vec![marker];
            data.extend((range).map(|i| bytes.get(i).copied().unwrap_or(0) & 0x7F));
            self.frame(family::SERIAL, data)
        };
        [half(0x00, 0..7), half(0x80, 7..14)]
    }

    pub fn version(&self, major: u8, minor: u8, patch: u8) -> CaptureFrame {
        self.frame(family::VERSION, [major, minor, patch])
    }

    /// `energy_counts` is the raw counter; the decoder scales it by 20 Wh.
    pub fn run_hours(&self, hours: u32, energy_counts: u32) -> CaptureFrame {
        let mut data = hours.to_be_bytes().to_vec();
        data.extend_from_slice(&energy_counts.to_be_bytes());
        self.frame(family::RUN_HOURS, data)
    }

    pub fn faults_ab(&self, a: u32, b: u32) -> CaptureFrame {
        self.frame(family::FAULTS_AB, pair(a, b))
    }

    pub fn faults_cd(&self, c: u32, d: u32) -> CaptureFrame {
        self.frame(family::FAULTS_CD, pair(c, d))
    }

    pub fn electrical(
        &self,
        power_w: i16,
        volts_centi: u16,
        current_centi: i16,
        anode_pressure_mbar: u16,
    ) -> CaptureFrame {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&power_w.to_be_bytes());
        data.extend_from_slice(&volts_centi.to_be_bytes());
        data.extend_from_slice(&current_centi.to_be_bytes());
        data.extend_from_slice(&anode_pressure_mbar.to_be_bytes());
        self.frame(family::ELECTRICAL, data)
    }

    pub fn thermal(
        &self,
        outlet_deci: i16,
        inlet_deci: i16,
        setpoint_centi: u16,
        limit_centi: u16,
    ) -> CaptureFrame {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&outlet_deci.to_be_bytes());
        data.extend_from_slice(&inlet_deci.to_be_bytes());
        data.extend_from_slice(&setpoint_centi.to_be_bytes());
        data.extend_from_slice(&limit_centi.to_be_bytes());
        self.frame(family::THERMAL, data)
    }

    pub fn actuator(&self, louver_pct: u16, fan_duty_pct: u16) -> CaptureFrame {
        let mut data = louver_pct.to_be_bytes().to_vec();
        data.extend_from_slice(&fan_duty_pct.to_be_bytes());
        self.frame(family::ACTUATOR, data)
    }

    pub fn state(
        &self,
        status: StatusFlags,
        load: LoadFlags,
        outputs: OutputFlags,
    ) -> CaptureFrame {
        self.frame(family::STATE, [status.bits(), load.bits(), outputs.bits()])
    }

    /// A complete 47 sub-frame telemetry burst starting at `start_ms`, one
    /// sub-frame every `step_ms`.
    pub fn burst(start_ms: u64, sequence: u8, step_ms: u64) -> Vec<CaptureFrame> {
        (0..=LAST_INDEX)
            .map(|index| {
                let mut data = vec![index];
                if index == 0 {
                    data.push(sequence);
                    data.extend_from_slice(&[0; 6]);
                } else {
                    data.extend_from_slice(&[index.wrapping_mul(3); 7]);
                }
                CaptureFrame::new(
                    start_ms + u64::from(index) * step_ms,
                    family::TELEMETRY_BURST,
                    data,
                )
            })
            .collect()
    }
}

fn pair(first: u32, second: u32) -> Vec<u8> {
    let mut data = first.to_be_bytes().to_vec();
    data.extend_from_slice(&second.to_be_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_identifiers() {
        let hex_row = CaptureRecord {
            offset_ms: 5,
            id: "0x139".into(),
            data: "0a 00 21".into(),
        };
        let frame = hex_row.parse().unwrap();
        assert_eq!(frame.identifier, 0x139);
        assert_eq!(frame.data, vec![0x0A, 0x00, 0x21]);

        let dec_row = CaptureRecord {
            offset_ms: 5,
            id: "313".into(),
            data: String::new(),
        };
        assert_eq!(dec_row.parse().unwrap().identifier, 0x139);
    }

    #[test]
    fn rejects_oversized_payload() {
        let row = CaptureRecord {
            offset_ms: 0,
            id: "0x120".into(),
            data: "000102030405060708".into(),
        };
        assert!(row.parse().is_err());
    }

    #[test]
    fn builder_sets_device_bits() {
        let frame = FrameBuilder::new(3).at(40).electrical(100, 4800, 250, 1500);
        assert_eq!(frame.identifier, family::ELECTRICAL | 3);
        assert_eq!(frame.offset_ms, 40);
        assert_eq!(frame.data.len(), 8);
    }

    #[test]
    fn burst_has_47_indexed_sub_frames() {
        let frames = FrameBuilder::burst(1_000, 7, 2);
        assert_eq!(frames.len(), 47);
        assert_eq!(frames[0].data[1], 7);
        assert_eq!(frames[46].data[0], LAST_INDEX);
        assert_eq!(frames[46].offset_ms, 1_092);
    }
}

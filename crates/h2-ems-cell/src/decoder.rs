//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-device frame decoder for fuel-cell modules."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Each frame family is a pure mutation of [`CellState`]. Callers hold the cell
//! lock for the duration of one `decode` call and must apply frames of a device
//! in arrival order: fault change detection compares against the previous write.

use bytes::Buf;
use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use crate::frame::family;
use crate::state::{CellState, FirmwareVersion, LoadFlags, OutputFlags, StatusFlags};

/// Fixed factor applied to the raw energy counter (Wh per count).
pub const ENERGY_SCALE: u64 = 20;

/// Signal returned to the demultiplexer after a successful decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Updated,
    /// A fault register pair was written; `changed` is true when any bit flipped.
    FaultRegisters { changed: bool },
    /// The state flags were written; `fault_raised` marks a false to true edge.
    State { fault_raised: bool },
}

pub fn decode(
    state: &mut CellState,
    family_id: u32,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<DecodeOutcome, DecodeError> {
    let outcome = match family_id {
        family::SERIAL => {
            require(family_id, payload, 8)?;
            let half = usize::from(payload[0] & 0x80 != 0);
            let offset = half * 8;
            for (slot, byte) in state.serial[offset..offset + 7]
                .iter_mut()
                .zip(&payload[1..8])
            {
                *slot = byte & 0x7F;
            }
            DecodeOutcome::Updated
        }
        family::VERSION => {
            require(family_id, payload, 3)?;
            state.version = Some(FirmwareVersion {
                major: payload[0],
                minor: payload[1],
                patch: payload[2],
            });
            DecodeOutcome::Updated
        }
        family::RUN_HOURS => {
            require(family_id, payload, 8)?;
            let mut buf = payload;
            state.telemetry.run_hours = buf.get_u32();
            state.telemetry.energy_wh = u64::from(buf.get_u32()) * ENERGY_SCALE;
            DecodeOutcome::Updated
        }
        family::FAULTS_AB => {
            require(family_id, payload, 8)?;
            let (a, b) = read_pair(payload);
            let changed = (a ^ state.faults.a) != 0 || (b ^ state.faults.b) != 0;
            state.faults.a = a;
            state.faults.b = b;
            DecodeOutcome::FaultRegisters { changed }
        }
        family::FAULTS_CD => {
            require(family_id, payload, 8)?;
            let (c, d) = read_pair(payload);
            let changed = (c ^ state.faults.c) != 0 || (d ^ state.faults.d) != 0;
            state.faults.c = c;
            state.faults.d = d;
            DecodeOutcome::FaultRegisters { changed }
        }
        family::ELECTRICAL => {
            require(family_id, payload, 8)?;
            let mut buf = payload;
            let t = &mut state.telemetry;
            t.power_w = buf.get_i16();
            t.volts_centi = buf.get_u16();
            t.current_centi = buf.get_i16();
            t.anode_pressure_mbar = buf.get_u16();
            DecodeOutcome::Updated
        }
        family::THERMAL => {
            require(family_id, payload, 8)?;
            let mut buf = payload;
            let t = &mut state.telemetry;
            t.outlet_temp_deci = buf.get_i16();
            t.inlet_temp_deci = buf.get_i16();
            t.dcdc_setpoint_centi = buf.get_u16();
            t.dcdc_limit_centi = buf.get_u16();
            DecodeOutcome::Updated
        }
        family::ACTUATOR => {
            require(family_id, payload, 4)?;
            let mut buf = payload;
            state.telemetry.louver_pct = buf.get_u16();
            state.telemetry.fan_duty_pct = buf.get_u16();
            DecodeOutcome::Updated
        }
        family::STATE => {
            require(family_id, payload, 3)?;
            let was_faulted = state.fault_active();
            state.status = StatusFlags::from_bits_truncate(payload[0]);
            state.load = LoadFlags::from_bits_truncate(payload[1]);
            state.outputs = OutputFlags::from_bits_truncate(payload[2]);
            DecodeOutcome::State {
                fault_raised: !was_faulted && state.fault_active(),
            }
        }
        other => return Err(DecodeError::UnknownFamily(other)),
    };
    state.touch(now);
    Ok(outcome)
}

fn require(family: u32, payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        return Err(DecodeError::ShortPayload {
            family,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_pair(payload: &[u8]) -> (u32, u32) {
    let mut buf = payload;
    (buf.get_u32(), buf.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn fault_register_change_detection() {
        let mut state = CellState::default();
        let payload = [0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x20];

        let first = decode(&mut state, family::FAULTS_AB, &payload, now()).unwrap();
        assert_eq!(first, DecodeOutcome::FaultRegisters { changed: true });
        let second = decode(&mut state, family::FAULTS_AB, &payload, now()).unwrap();
        assert_eq!(second, DecodeOutcome::FaultRegisters { changed: false });

        for byte in 0..8 {
            for bit in 0..8 {
                let mut flipped = payload;
                flipped[byte] ^= 1 << bit;
                let mut probe = state.clone();
                let outcome = decode(&mut probe, family::FAULTS_AB, &flipped, now()).unwrap();
                assert_eq!(outcome, DecodeOutcome::FaultRegisters { changed: true });
            }
        }
        assert_eq!(state.faults.a, 0x28);
        assert_eq!(state.faults.b, 0x20);
    }

    #[test]
    fn cd_pair_is_tracked_independently() {
        let mut state = CellState::default();
        decode(&mut state, family::FAULTS_AB, &[0, 0, 0, 1, 0, 0, 0, 0], now()).unwrap();
        let outcome = decode(&mut state, family::FAULTS_CD, &[0; 8], now()).unwrap();
        assert_eq!(outcome, DecodeOutcome::FaultRegisters { changed: false });
        let payload = [0x80, 0, 0, 0, 0, 0, 0, 0];
        let outcome = decode(&mut state, family::FAULTS_CD, &payload, now()).unwrap();
        assert_eq!(outcome, DecodeOutcome::FaultRegisters { changed: true });
        assert_eq!(state.faults.c, 0x8000_0000);
    }

    #[test]
    fn serial_halves_fill_buffer() {
        let mut state = CellState::default();
        let lower = [0x00, b'F', b'C', b'-', b'0', b'0', b'4', b'2'];
        let upper = [0x80, b'-', b'A' | 0x80, b'7', 0, 0, 0, 0];
        decode(&mut state, family::SERIAL, &lower, now()).unwrap();
        decode(&mut state, family::SERIAL, &upper, now()).unwrap();
        assert_eq!(&state.serial[..7], b"FC-0042");
        assert_eq!(state.serial[7], 0);
        assert_eq!(&state.serial[8..11], b"-A7");
        assert_eq!(state.serial_string(), "FC-0042-A7");
    }

    #[test]
    fn state_frame_reports_rising_fault_edge_only() {
        let mut state = CellState::default();
        let run = StatusFlags::RUN.bits();
        let fault = (StatusFlags::RUN | StatusFlags::FAULT).bits();

        let outcome = decode(&mut state, family::STATE, &[run, 0, 0], now()).unwrap();
        assert_eq!(outcome, DecodeOutcome::State { fault_raised: false });
        let outcome = decode(&mut state, family::STATE, &[fault, 0x02, 0x21], now()).unwrap();
        assert_eq!(outcome, DecodeOutcome::State { fault_raised: true });
        let outcome = decode(&mut state, family::STATE, &[fault, 0x02, 0x21], now()).unwrap();
        assert_eq!(outcome, DecodeOutcome::State { fault_raised: false });

        assert!(state.load.contains(LoadFlags::ON_LOAD));
        assert!(state.outputs.contains(OutputFlags::OUT0 | OutputFlags::OUT5));
    }

    #[test]
    fn electrical_and_energy_fields() {
        let mut state = CellState::default();
        // -100 W, 48.00 V, -2.00 A, 1500 mbar
        let payload = [0xFF, 0x9C, 0x12, 0xC0, 0xFF, 0x38, 0x05, 0xDC];
        decode(&mut state, family::ELECTRICAL, &payload, now()).unwrap();
        assert_eq!(state.telemetry.power_w, -100);
        assert_eq!(state.telemetry.volts_centi, 4800);
        assert_eq!(state.telemetry.current_centi, -200);
        assert_eq!(state.telemetry.anode_pressure_mbar, 1500);

        decode(&mut state, family::RUN_HOURS, &[0, 0, 0x01, 0x00, 0, 0, 0, 5], now()).unwrap();
        assert_eq!(state.telemetry.run_hours, 256);
        assert_eq!(state.telemetry.energy_wh, 100);
    }

    #[test]
    fn short_payload_leaves_state_untouched() {
        let mut state = CellState::default();
        let err = decode(&mut state, family::THERMAL, &[1, 2, 3], now()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ShortPayload {
                family: family::THERMAL,
                expected: 8,
                actual: 3
            }
        );
        assert!(state.last_update.is_none());
    }

    #[test]
    fn successful_decode_updates_heartbeat() {
        let mut state = CellState::default();
        let at = now();
        decode(&mut state, family::VERSION, &[2, 1, 9], at).unwrap();
        assert_eq!(state.last_update, Some(at));
        assert_eq!(state.version.map(|v| v.to_string()).as_deref(), Some("2.1.9"));
    }

    #[test]
    fn unknown_family_is_rejected() {
        let mut state = CellState::default();
        assert_eq!(
            decode(&mut state, 0x200, &[0; 8], now()).unwrap_err(),
            DecodeError::UnknownFamily(0x200)
        );
    }
}

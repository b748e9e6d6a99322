//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus-global telemetry burst reassembly."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::AssemblyError;

/// Highest sub-frame index of a burst; accepting it completes the record.
pub const LAST_INDEX: u8 = 0x2E;

/// Sub-frames per complete burst.
pub const BURST_LEN: usize = LAST_INDEX as usize + 1;

/// Data bytes carried by one sub-frame after the index byte.
pub const ENTRY_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BurstEntry {
    pub index: u8,
    #[serde(serialize_with = "as_hex")]
    pub data: [u8; ENTRY_LEN],
    /// Milliseconds since the record's start time.
    pub offset_ms: u64,
}

fn as_hex<S: Serializer>(data: &[u8; ENTRY_LEN], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(data))
}

/// One completed multi-part telemetry burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryRecord {
    pub start_time: DateTime<Utc>,
    /// Sequence counter carried by sub-frame 0.
    pub sequence: u8,
    /// Accepted entries ordered by sub-frame index.
    pub entries: Vec<BurstEntry>,
}

impl TelemetryRecord {
    pub fn is_complete(&self) -> bool {
        self.entries.len() == BURST_LEN
    }
}

#[derive(Debug)]
struct InFlight {
    start_time: DateTime<Utc>,
    sequence: u8,
    slots: Vec<Option<BurstEntry>>,
}

impl InFlight {
    fn into_record(self) -> TelemetryRecord {
        TelemetryRecord {
            start_time: self.start_time,
            sequence: self.sequence,
            entries: self.slots.into_iter().flatten().collect(),
        }
    }
}

/// Reassembles the telemetry burst family. One record in flight per bus.
#[derive(Debug, Default)]
pub struct TelemetryAssembler {
    in_flight: Option<InFlight>,
    expected_sequence: Option<u8>,
}

impl TelemetryAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Sub-frames accepted into the record in flight.
    pub fn pending_entries(&self) -> usize {
        self.in_flight
            .as_ref()
            .map(|burst| burst.slots.iter().filter(|slot| slot.is_some()).count())
            .unwrap_or(0)
    }

    /// Accept one sub-frame. Returns the completed record when the terminal index
    /// is accepted. Errors never disturb the record in flight.
    pub fn accept(
        &mut self,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<TelemetryRecord>, AssemblyError> {
        if payload.len() < ENTRY_LEN + 1 {
            return Err(AssemblyError::ShortSubFrame(payload.len()));
        }
        let index = payload[0];
        if index > LAST_INDEX {
            return Err(AssemblyError::IndexOutOfRange(index));
        }

        if index == 0 {
            let sequence = payload[1];
            self.check_sequence(sequence);
            if let Some(stale) = self.in_flight.take() {
                warn!(
                    target: "h2_ems::assembler",
                    started = %stale.start_time,
                    entries = stale.slots.iter().filter(|slot| slot.is_some()).count(),
                    "discarding unfinished telemetry burst"
                );
            }
            self.in_flight = Some(InFlight {
                start_time: now,
                sequence,
                slots: vec![None; BURST_LEN],
            });
        }

        let burst = self
            .in_flight
            .as_mut()
            .ok_or(AssemblyError::Orphan(index))?;

        let mut data = [0u8; ENTRY_LEN];
        data.copy_from_slice(&payload[1..=ENTRY_LEN]);
        let offset_ms = (now - burst.start_time).num_milliseconds().max(0) as u64;
        burst.slots[usize::from(index)] = Some(BurstEntry {
            index,
            data,
            offset_ms,
        });

        if index == LAST_INDEX {
            let record = self.in_flight.take().map(InFlight::into_record);
            if let Some(record) = &record {
                debug!(
                    target: "h2_ems::assembler",
                    sequence = record.sequence,
                    entries = record.entries.len(),
                    "telemetry burst complete"
                );
            }
            return Ok(record);
        }
        Ok(None)
    }

    fn check_sequence(&mut self, observed: u8) {
        if let Some(expected) = self.expected_sequence {
            if expected != observed {
                debug!(
                    target: "h2_ems::assembler",
                    expected,
                    observed,
                    "burst sequence counter mismatch; resynchronising"
                );
            }
        }
        self.expected_sequence = Some(if observed >= LAST_INDEX { 0 } else { observed + 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn sub_frame(index: u8, fill: u8) -> [u8; 8] {
        [index, fill, fill, fill, fill, fill, fill, fill]
    }

    #[test]
    fn full_burst_yields_one_record() {
        let mut assembler = TelemetryAssembler::new();
        let start = at(0);
        let mut completed = Vec::new();
        for index in 0..=LAST_INDEX {
            let now = start + Duration::milliseconds(i64::from(index) * 2);
            if let Some(record) = assembler.accept(&sub_frame(index, index), now).unwrap() {
                completed.push(record);
            }
        }
        assert_eq!(completed.len(), 1);
        let record = &completed[0];
        assert!(record.is_complete());
        assert_eq!(record.entries.len(), 47);
        assert_eq!(record.entries[0].offset_ms, 0);
        assert!(record
            .entries
            .windows(2)
            .all(|pair| pair[0].offset_ms <= pair[1].offset_ms));
        assert_eq!(record.start_time, start);
        assert!(!assembler.in_flight());
    }

    #[test]
    fn out_of_range_index_leaves_record_untouched() {
        let mut assembler = TelemetryAssembler::new();
        assembler.accept(&sub_frame(0, 1), at(0)).unwrap();
        assembler.accept(&sub_frame(1, 2), at(1)).unwrap();

        for bad in [LAST_INDEX + 1, 0x7F, 0xFF] {
            let err = assembler.accept(&sub_frame(bad, 9), at(2)).unwrap_err();
            assert_eq!(err, AssemblyError::IndexOutOfRange(bad));
        }
        assert!(assembler.in_flight());
        assert_eq!(assembler.pending_entries(), 2);

        for index in 2..=LAST_INDEX {
            let done = assembler.accept(&sub_frame(index, 3), at(3)).unwrap();
            if index == LAST_INDEX {
                assert_eq!(done.unwrap().entries.len(), 47);
            }
        }
    }

    #[test]
    fn orphan_and_short_sub_frames_are_rejected() {
        let mut assembler = TelemetryAssembler::new();
        assert_eq!(
            assembler.accept(&sub_frame(5, 0), at(0)).unwrap_err(),
            AssemblyError::Orphan(5)
        );
        assert_eq!(
            assembler.accept(&[0, 1, 2], at(0)).unwrap_err(),
            AssemblyError::ShortSubFrame(3)
        );
        assert!(!assembler.in_flight());
    }

    #[test]
    fn index_zero_restarts_the_record() {
        let mut assembler = TelemetryAssembler::new();
        assembler.accept(&sub_frame(0, 0), at(0)).unwrap();
        assembler.accept(&sub_frame(1, 0), at(5)).unwrap();
        assembler.accept(&sub_frame(0, 1), at(100)).unwrap();
        assert_eq!(assembler.pending_entries(), 1);

        let mut record = None;
        for index in 1..=LAST_INDEX {
            record = assembler.accept(&sub_frame(index, 1), at(110)).unwrap();
        }
        let record = record.unwrap();
        assert_eq!(record.start_time, at(100));
        assert_eq!(record.sequence, 1);
    }

    #[test]
    fn sequence_mismatch_never_blocks_assembly() {
        let mut assembler = TelemetryAssembler::new();
        for sequence in [0x2E_u8, 0x05] {
            let mut frame = sub_frame(0, 0);
            frame[1] = sequence;
            assembler.accept(&frame, at(0)).unwrap();
            let mut record = None;
            for index in 1..=LAST_INDEX {
                record = assembler.accept(&sub_frame(index, 0), at(1)).unwrap();
            }
            assert_eq!(record.unwrap().sequence, sequence);
        }
        assert_eq!(assembler.expected_sequence, Some(6));
    }
}

//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Offline decoding of bus captures."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use h2_ems_cell::{
    CellRegistry, CellSnapshot, ControlInputs, FaultTable, FrameDemultiplexer, FrameOutcome,
    IdleWatchdog, TelemetryRecord,
};
use h2_ems_common::AppConfig;
use h2_ems_sim::ReplayEngine;
use serde::Serialize;

use crate::ingest::{IngestCounts, IngestStats};

/// Result of pushing a whole capture through the demultiplexer.
#[derive(Debug, Clone, Serialize)]
pub struct OfflineReport {
    pub counts: IngestCounts,
    pub bursts: Vec<TelemetryRecord>,
    /// Taken at the time of the last frame.
    pub snapshots: Vec<CellSnapshot>,
}

/// Decode `engine` as if it had been received starting at `base`. Frame time
/// drives the heartbeat and the idle watchdog; no recovery actions are taken.
pub fn decode_capture(
    engine: &ReplayEngine,
    table: &FaultTable,
    config: &AppConfig,
    base: DateTime<Utc>,
) -> Result<OfflineReport> {
    let registry = Arc::new(CellRegistry::new());
    let controls = Arc::new(ControlInputs::from_config(&config.recording));
    let watchdog = Arc::new(IdleWatchdog::new(
        Arc::clone(&registry),
        config.bus.idle_timeout,
    ));
    let mut demux = FrameDemultiplexer::new(Arc::clone(&registry), controls, Arc::clone(&watchdog));
    let stats = IngestStats::default();
    let mut bursts = Vec::new();
    let mut now = base;

    for (n, frame) in engine.frames().iter().enumerate() {
        let raw = frame
            .to_raw(base)
            .with_context(|| format!("capture frame {n} is malformed"))?;
        now = raw.received_at;
        watchdog.poll(now);
        let outcome = demux.handle(&raw);
        stats.record(&outcome);
        if let FrameOutcome::BurstComplete(record) = outcome {
            bursts.push(record);
        }
    }

    Ok(OfflineReport {
        counts: stats.counts(),
        bursts,
        snapshots: registry.snapshots(table, now, config.telemetry.heartbeat_window),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use h2_ems_cell::state::StatusFlags;
    use h2_ems_cell::state::{LoadFlags, OutputFlags};
    use h2_ems_sim::FrameBuilder;

    #[test]
    fn capture_decodes_into_snapshots_and_bursts() {
        let cell = FrameBuilder::new(1);
        let mut frames = cell.serial("FC-0001-B2").to_vec();
        frames.push(cell.at(10).electrical(1_200, 4_850, 2_474, 1_480));
        frames.push(cell.at(20).state(StatusFlags::RUN, LoadFlags::ON_LOAD, OutputFlags::empty()));
        frames.extend(FrameBuilder::burst(100, 3, 1));
        frames.push(cell.at(200).version(2, 1, 0));

        let engine = ReplayEngine::new(frames);
        let base = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();
        let report =
            decode_capture(&engine, &FaultTable::new(), &AppConfig::default(), base).unwrap();

        assert_eq!(report.bursts.len(), 1);
        assert_eq!(report.bursts[0].entries.len(), 47);
        assert_eq!(report.counts.decoded, 5);
        assert_eq!(report.counts.bursts, 1);
        let snapshot = &report.snapshots[0];
        assert_eq!(snapshot.serial, "FC-0001-B2");
        assert!(snapshot.switched_on);
        assert!(snapshot.flags.run);
        assert!((snapshot.volts - 48.5).abs() < 1e-9);
    }

    #[test]
    fn silence_in_capture_clears_telemetry() {
        let cell = FrameBuilder::new(0);
        let frames = vec![
            cell.electrical(900, 4_700, 1_900, 1_500),
            cell.at(6_000).version(1, 0, 0),
        ];
        let base = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();
        let report = decode_capture(
            &ReplayEngine::new(frames),
            &FaultTable::new(),
            &AppConfig::default(),
            base,
        )
        .unwrap();
        let snapshot = &report.snapshots[0];
        assert_eq!(snapshot.power_w, 0.0);
        assert!(snapshot.version.is_some());
    }
}

//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "End-to-end pipeline tests from bus capture to record log."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use h2_ems_cell::state::{LoadFlags, OutputFlags, StatusFlags};
use h2_ems_cell::{
    ActuationError, DeviceId, FaultBank, FaultRegisters, FaultTable, ModuleControl, Notifier,
    NotifyError, PowerIntent, RestartNotice, Severity,
};
use h2_ems_common::{AppConfig, Clock, DeviceLogPolicy};
use h2_ems_core::{decode_capture, Collaborators, Supervisor};
use h2_ems_persistence::{EventLogConnector, EventLogReader};
use h2_ems_sim::{
    write_capture_csv, CaptureFrame, FrameBuilder, Pacing, ReplayConnector, ReplayEngine,
};
use parking_lot::Mutex;
use tempfile::tempdir;

const FAULT_TABLE: &str = r#"
[[fault]]
bank = "A"
bit = 3
severity = 2
reboot_required = false
tag = "ANODE_LOW"
description = "Anode pressure below limit"

[[fault]]
bank = "B"
bit = 5
severity = 4
reboot = true
tag = "H2_LEAK"
description = "Hydrogen concentration alarm"

[[fault]]
bank = "E"
bit = 1
severity = 1
tag = "BOGUS"
"#;

/// Wall clock that follows tokio time, so paused tests advance both together.
#[derive(Debug)]
struct TokioClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            base: Utc.with_ymd_and_hms(2026, 7, 14, 6, 0, 0).unwrap(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.base
            + chrono::Duration::from_std(self.start.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[derive(Debug, Default)]
struct RecordingControl {
    events: Mutex<Vec<(DeviceId, &'static str)>>,
}

#[async_trait]
impl ModuleControl for RecordingControl {
    async fn intent(&self, _device: DeviceId) -> PowerIntent {
        PowerIntent::default()
    }

    async fn power_off(&self, device: DeviceId) -> Result<(), ActuationError> {
        self.events.lock().push((device, "off"));
        Ok(())
    }

    async fn power_on(&self, device: DeviceId, _intent: PowerIntent) -> Result<(), ActuationError> {
        self.events.lock().push((device, "on"));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<RestartNotice>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &RestartNotice) -> Result<(), NotifyError> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

fn write_fault_table(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("faults.toml");
    fs::write(&path, FAULT_TABLE).unwrap();
    path
}

/// Module 1 reporting a continuous fault for `seconds`, with one burst early on.
fn faulted_capture(seconds: u64) -> Vec<CaptureFrame> {
    let cell = FrameBuilder::new(1);
    let mut frames = cell.serial("FC-7781-C").to_vec();
    frames.push(cell.faults_ab(1 << 3, 1 << 5));
    for second in 0..=seconds {
        let at = second * 1_000;
        frames.push(cell.at(at).state(
            StatusFlags::RUN | StatusFlags::FAULT,
            LoadFlags::DERATED,
            OutputFlags::OUT0 | OutputFlags::OUT1,
        ));
        frames.push(cell.at(at + 10).electrical(800, 4_620, 1_730, 1_210));
    }
    frames.extend(FrameBuilder::burst(100, 0, 1));
    frames
}

#[test]
fn csv_capture_decodes_with_loaded_fault_table() {
    let dir = tempdir().unwrap();
    let table = FaultTable::load(&write_fault_table(dir.path())).unwrap();
    assert_eq!(table.len(), 2, "row with an unknown bank is skipped");
    let assessment = table.resolve(&FaultRegisters::new(0x0000_0028, 0x0000_0020, 0, 0));
    assert_eq!(assessment.severity, Severity::Critical);
    assert!(assessment.reboot_required);

    let capture = dir.path().join("capture.csv");
    write_capture_csv(&capture, &faulted_capture(3)).unwrap();
    let engine = ReplayEngine::from_path(&capture).unwrap();
    let base = Utc.with_ymd_and_hms(2026, 7, 14, 6, 0, 0).unwrap();
    let report = decode_capture(&engine, &table, &AppConfig::default(), base).unwrap();

    assert_eq!(report.bursts.len(), 1);
    assert_eq!(report.counts.dropped, 0);
    let snapshot = &report.snapshots[0];
    assert_eq!(snapshot.serial, "FC-7781-C");
    assert_eq!(snapshot.severity, Severity::Critical);
    assert!(snapshot.reboot_required);
    assert!(snapshot.flags.derated);
    assert_eq!(snapshot.fault_descriptions[&FaultBank::A].len(), 1);
    assert!(snapshot.fault_descriptions[&FaultBank::B][0].contains("H2_LEAK"));
}

#[tokio::test(start_paused = true)]
async fn continuous_fault_restarts_module_and_records_telemetry() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("records.log");
    let table = FaultTable::load(&write_fault_table(dir.path())).unwrap();

    let mut config = AppConfig::default();
    config.persistence.event_log = log_path.clone();
    config.recording.default_policy = DeviceLogPolicy {
        log_on_enable: false,
        log_on_run: true,
    };
    config.recovery.max_restarts = 2;

    let clock: Arc<TokioClock> = Arc::new(TokioClock::new());
    let control = Arc::new(RecordingControl::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let connector = ReplayConnector::new(
        "faulted",
        ReplayEngine::new(faulted_capture(70)),
        Pacing::real_time(None),
        clock.clone(),
    );

    let handle = Supervisor::new(
        config,
        table,
        Collaborators {
            connector: Arc::new(connector),
            control: control.clone(),
            notifier: notifier.clone(),
            sink: Some(Arc::new(EventLogConnector::new(&log_path))),
            clock: clock.clone(),
            metrics: None,
        },
    )
    .start()
    .unwrap();

    handle.ingest_finished().await;
    {
        let notices = notifier.notices.lock();
        assert_eq!(notices.len(), 1, "one restart inside 70 s of continuous fault");
        assert_eq!(notices[0].attempt, 1);
        assert_eq!(notices[0].max_attempts, 2);
        assert_eq!(notices[0].severity, Severity::Critical);
        assert!(notices[0].faults[&FaultBank::A][0].contains("ANODE_LOW"));
    }

    // Let the delayed power-on fire.
    tokio::time::sleep(Duration::from_secs(15)).await;
    let events = control.events.lock().clone();
    assert_eq!(
        events,
        vec![(DeviceId::new(1), "off"), (DeviceId::new(1), "on")]
    );
    let book = handle.registry().get(DeviceId::new(1)).unwrap().state_copy().recovery;
    assert_eq!(book.restart_attempts, 1);

    handle.shutdown().await.unwrap();

    let entries: Vec<_> = EventLogReader::open(&log_path)
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect();
    assert_eq!(entries.iter().filter(|e| e.kind == "burst").count(), 1);
    assert!(entries
        .iter()
        .any(|e| e.kind == "snapshot" && e.payload["reason"] == "fault_raised"));
    assert!(entries
        .iter()
        .any(|e| e.kind == "snapshot" && e.payload["reason"] == "periodic"));
}

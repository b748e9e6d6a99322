//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Supervisor lifecycle tests over in-memory bus connectors."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use h2_ems_cell::state::{LoadFlags, OutputFlags, StatusFlags};
use h2_ems_cell::{
    ActuationError, BusConnector, ChannelConnector, DeviceId, FaultTable, FrameSource,
    LoggingModuleControl, ModuleControl, Notifier, NotifyError, PowerIntent, RestartNotice,
    TracingNotifier, TransportError,
};
use h2_ems_common::{AppConfig, Clock, ManualClock, RecordingWindowConfig, SharedClock};
use h2_ems_core::{Collaborators, Supervisor};
use h2_ems_persistence::{EventLogConnector, EventLogReader};
use h2_ems_sim::FrameBuilder;
use prometheus::Registry;
use tempfile::tempdir;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
    ))
}

fn collaborators(connector: Arc<dyn BusConnector>, clock: SharedClock) -> Collaborators {
    Collaborators {
        connector,
        control: Arc::new(LoggingModuleControl::new()),
        notifier: Arc::new(TracingNotifier),
        sink: None,
        clock,
        metrics: None,
    }
}

#[tokio::test]
async fn ingested_bursts_and_fault_dumps_reach_the_record_log() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("records.log");
    let clock = clock();
    let now = clock.now();

    let mut config = AppConfig::default();
    config.persistence.event_log = log_path.clone();
    config.recording.window = Some(RecordingWindowConfig {
        start: now - chrono::Duration::hours(1),
        end: now + chrono::Duration::hours(1),
    });

    let (tx, connector) = ChannelConnector::new("unit", 128);
    let mut collaborators = collaborators(Arc::new(connector), clock.clone());
    collaborators.sink = Some(Arc::new(EventLogConnector::new(&log_path)));
    collaborators.metrics = Some(Arc::new(Registry::new()));

    let handle = Supervisor::new(config, FaultTable::new(), collaborators)
        .start()
        .unwrap();

    let cell = FrameBuilder::new(2);
    let mut frames = vec![
        cell.electrical(1_500, 4_900, 3_000, 1_510),
        cell.state(StatusFlags::RUN, LoadFlags::ON_LOAD, OutputFlags::OUT0),
    ];
    frames.extend(FrameBuilder::burst(5, 0, 1));
    frames.push(cell.at(60).faults_ab(0x8, 0));
    frames.push(cell.at(61).state(
        StatusFlags::RUN | StatusFlags::FAULT,
        LoadFlags::empty(),
        OutputFlags::empty(),
    ));
    for frame in &frames {
        tx.send(frame.to_raw(now).unwrap()).await.unwrap();
    }
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), handle.ingest_finished())
        .await
        .expect("ingestion should finish once the channel closes");

    let counts = handle.ingest_counts();
    assert_eq!(counts.bursts, 1);
    assert_eq!(counts.decoded, 4);
    let snapshots = handle.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].flags.fault);

    let metrics = handle.persistence_metrics().cloned().unwrap();
    handle.shutdown().await.unwrap();

    let entries: Vec<_> = EventLogReader::open(&log_path)
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect();
    assert_eq!(entries.iter().filter(|e| e.kind == "burst").count(), 1);
    assert!(entries.iter().any(|e| {
        e.kind == "snapshot" && e.device == Some(2) && e.payload["reason"] == "fault_raised"
    }));
    assert_eq!(metrics.persisted("burst"), 1);
}

#[tokio::test]
async fn maintenance_suppresses_everything() {
    let clock = clock();
    let (tx, connector) = ChannelConnector::new("unit", 16);
    let handle = Supervisor::new(
        AppConfig::default(),
        FaultTable::new(),
        collaborators(Arc::new(connector), clock.clone()),
    )
    .start()
    .unwrap();
    handle.controls().set_maintenance(true);

    let cell = FrameBuilder::new(1);
    tx.send(cell.version(1, 2, 3).to_raw(clock.now()).unwrap())
        .await
        .unwrap();
    drop(tx);
    handle.ingest_finished().await;

    assert!(handle.registry().is_empty());
    assert_eq!(handle.ingest_counts().suppressed, 1);
    handle.shutdown().await.unwrap();
}

#[derive(Debug, Clone, Default)]
struct DeadAdapter {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl BusConnector for DeadAdapter {
    fn describe(&self) -> String {
        "dead".into()
    }

    async fn connect(&self) -> Result<Box<dyn FrameSource>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Unavailable("dead".into()))
    }
}

#[tokio::test]
async fn reconnect_loop_stops_on_shutdown() {
    let adapter = DeadAdapter::default();
    let mut config = AppConfig::default();
    config.bus.reconnect_delay = Duration::from_secs(30);

    let handle = Supervisor::new(
        config,
        FaultTable::new(),
        collaborators(Arc::new(adapter.clone()), clock()),
    )
    .start()
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(handle.ingest_counts().reconnects, 1);

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("shutdown must interrupt the reconnect delay")
        .unwrap();
}

#[derive(Debug, Default)]
struct CountingControl {
    power_ons: AtomicUsize,
    notices: AtomicUsize,
}

#[async_trait]
impl ModuleControl for CountingControl {
    async fn intent(&self, _device: DeviceId) -> PowerIntent {
        PowerIntent::default()
    }

    async fn power_off(&self, _device: DeviceId) -> Result<(), ActuationError> {
        Ok(())
    }

    async fn power_on(
        &self,
        _device: DeviceId,
        _intent: PowerIntent,
    ) -> Result<(), ActuationError> {
        self.power_ons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Notifier for CountingControl {
    async fn notify(&self, _notice: &RestartNotice) -> Result<(), NotifyError> {
        self.notices.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_no_power_cycle_behind() {
    let clock = clock();
    let mut config = AppConfig::default();
    config.recovery.fault_hold = Duration::ZERO;

    let counting = Arc::new(CountingControl::default());
    let (tx, connector) = ChannelConnector::new("unit", 16);
    let mut collaborators = collaborators(Arc::new(connector), clock.clone());
    collaborators.control = counting.clone();
    collaborators.notifier = counting.clone();
    let handle = Supervisor::new(config, FaultTable::new(), collaborators)
        .start()
        .unwrap();

    let cell = FrameBuilder::new(3);
    let faulted = cell.state(
        StatusFlags::RUN | StatusFlags::FAULT,
        LoadFlags::empty(),
        OutputFlags::empty(),
    );
    tx.send(faulted.to_raw(clock.now()).unwrap()).await.unwrap();

    for _ in 0..50 {
        if counting.notices.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(counting.notices.load(Ordering::SeqCst), 1);

    handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(counting.power_ons.load(Ordering::SeqCst), 0);
    drop(tx);
}

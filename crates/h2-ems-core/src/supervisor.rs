//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Supervisor task wiring and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use h2_ems_cell::{
    handoff_channel, BusConnector, CellRegistry, CellSnapshot, ControlInputs, FaultTable,
    FrameDemultiplexer, HandoffSender, IdleWatchdog, ModuleControl, Notifier, PersistItem,
    RecoveryMonitor, RecoveryPolicy, SnapshotReason,
};
use h2_ems_common::{AppConfig, SharedClock};
use h2_ems_persistence::{PersistenceAdapter, PersistenceMetrics, SinkConnector};
use h2_ems_rt::{RateLimiter, TaskGroup};
use prometheus::Registry;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::ingest::{IngestCounts, IngestStats, IngestTask};

/// External collaborators the supervisor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn BusConnector>,
    pub control: Arc<dyn ModuleControl>,
    pub notifier: Arc<dyn Notifier>,
    /// `None` disables persistence regardless of configuration.
    pub sink: Option<Arc<dyn SinkConnector>>,
    pub clock: SharedClock,
    pub metrics: Option<Arc<Registry>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("connector", &self.connector.describe())
            .field("sink", &self.sink.as_ref().map(|sink| sink.describe()))
            .finish_non_exhaustive()
    }
}

/// Primary supervisor entrypoint.
#[derive(Debug)]
pub struct Supervisor {
    config: Arc<AppConfig>,
    table: Arc<FaultTable>,
    collaborators: Collaborators,
}

impl Supervisor {
    pub fn new(config: AppConfig, table: FaultTable, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            table: Arc::new(table),
            collaborators,
        }
    }

    /// Spawn every runtime task and return a handle for lifecycle control.
    pub fn start(self) -> Result<SupervisorHandle> {
        let Collaborators {
            connector,
            control,
            notifier,
            sink,
            clock,
            metrics,
        } = self.collaborators;
        let config = self.config;
        let table = self.table;

        let (shutdown_tx, _) = broadcast::channel(16);
        let registry = Arc::new(CellRegistry::new());
        let controls = Arc::new(ControlInputs::from_config(&config.recording));
        let watchdog = Arc::new(IdleWatchdog::new(
            Arc::clone(&registry),
            config.bus.idle_timeout,
        ));
        let monitor = Arc::new(RecoveryMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&table),
            RecoveryPolicy::from_config(&config.recovery),
            control,
            notifier,
            clock.clone(),
        ));
        let persistence_metrics = match &metrics {
            Some(registry) => Some(PersistenceMetrics::new(Arc::clone(registry))?),
            None => None,
        };

        let mut tasks = TaskGroup::new();
        let sink = sink.filter(|_| config.persistence.enabled);
        let handoff = match sink {
            Some(sink) => {
                let (tx, rx) = handoff_channel(config.bus.handoff_capacity);
                let adapter = PersistenceAdapter::new(
                    sink,
                    Arc::clone(&controls),
                    persistence_metrics.clone(),
                    clock.clone(),
                );
                let shutdown = shutdown_tx.subscribe();
                tasks.spawn("persistence", async move {
                    adapter.run(rx, shutdown).await;
                    Ok(())
                });
                Some(tx)
            }
            None => {
                info!(
                    target: "h2_ems::supervisor",
                    "persistence disabled; bursts and snapshots are not recorded"
                );
                None
            }
        };

        let stats = Arc::new(IngestStats::default());
        let (finished_tx, finished_rx) = watch::channel(false);
        let ingest = IngestTask {
            connector: Arc::clone(&connector),
            demux: FrameDemultiplexer::new(
                Arc::clone(&registry),
                Arc::clone(&controls),
                Arc::clone(&watchdog),
            ),
            handoff: handoff.clone(),
            table: Arc::clone(&table),
            clock: clock.clone(),
            heartbeat_window: config.telemetry.heartbeat_window,
            reconnect_delay: config.bus.reconnect_delay,
            stats: Arc::clone(&stats),
            finished: finished_tx,
        };
        tasks.spawn("ingest", ingest.run(shutdown_tx.subscribe()));

        tasks.spawn(
            "watchdog",
            watchdog_loop(
                watchdog,
                clock.clone(),
                config.bus.watchdog_poll,
                shutdown_tx.subscribe(),
            ),
        );

        tasks.spawn(
            "recovery",
            sweep_loop(SweepContext {
                monitor: Arc::clone(&monitor),
                registry: Arc::clone(&registry),
                table: Arc::clone(&table),
                handoff,
                clock: clock.clone(),
                heartbeat_window: config.telemetry.heartbeat_window,
                period: config.recovery.sweep_interval,
                shutdown: shutdown_tx.subscribe(),
            }),
        );

        tasks.spawn(
            "telemetry",
            telemetry_loop(
                Arc::clone(&registry),
                Arc::clone(&table),
                clock.clone(),
                config.telemetry.heartbeat_window,
                config.telemetry.log_interval,
                shutdown_tx.subscribe(),
            ),
        );

        info!(
            target: "h2_ems::supervisor",
            bus = %connector.describe(),
            faults = table.len(),
            tasks = tasks.len(),
            "supervisor started"
        );

        Ok(SupervisorHandle {
            shutdown: shutdown_tx,
            tasks,
            config,
            table,
            registry,
            controls,
            monitor,
            clock,
            stats,
            finished: finished_rx,
            persistence_metrics,
        })
    }
}

/// Handle returned from [`Supervisor::start`].
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown: broadcast::Sender<()>,
    tasks: TaskGroup,
    config: Arc<AppConfig>,
    table: Arc<FaultTable>,
    registry: Arc<CellRegistry>,
    controls: Arc<ControlInputs>,
    monitor: Arc<RecoveryMonitor>,
    clock: SharedClock,
    stats: Arc<IngestStats>,
    finished: watch::Receiver<bool>,
    persistence_metrics: Option<PersistenceMetrics>,
}

impl SupervisorHandle {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CellRegistry> {
        &self.registry
    }

    /// Maintenance flag, recording window and device policies.
    pub fn controls(&self) -> &Arc<ControlInputs> {
        &self.controls
    }

    pub fn monitor(&self) -> &Arc<RecoveryMonitor> {
        &self.monitor
    }

    pub fn persistence_metrics(&self) -> Option<&PersistenceMetrics> {
        self.persistence_metrics.as_ref()
    }

    pub fn ingest_counts(&self) -> IngestCounts {
        self.stats.counts()
    }

    /// Snapshot of every known module.
    pub fn snapshots(&self) -> Vec<CellSnapshot> {
        self.registry.snapshots(
            &self.table,
            self.clock.now(),
            self.config.telemetry.heartbeat_window,
        )
    }

    /// Resolves once a finite frame source has been fully ingested. Never
    /// resolves for a live adapter.
    pub async fn ingest_finished(&self) {
        let mut finished = self.finished.clone();
        // An error means the ingestion task is gone; nothing more will arrive.
        let _ = finished.wait_for(|done| *done).await;
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        let joined = self.tasks.join().await;
        // After the sweep task has stopped, so no cycle is scheduled behind the cancel.
        self.monitor.shutdown();
        joined?;
        info!(
            target: "h2_ems::supervisor",
            counts = ?self.stats.counts(),
            "supervisor shutdown complete"
        );
        Ok(())
    }
}

async fn watchdog_loop(
    watchdog: Arc<IdleWatchdog>,
    clock: SharedClock,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut limiter = RateLimiter::new(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = limiter.tick() => {
                watchdog.poll(clock.now());
            }
        }
    }
    Ok(())
}

struct SweepContext {
    monitor: Arc<RecoveryMonitor>,
    registry: Arc<CellRegistry>,
    table: Arc<FaultTable>,
    handoff: Option<HandoffSender>,
    clock: SharedClock,
    heartbeat_window: Duration,
    period: Duration,
    shutdown: broadcast::Receiver<()>,
}

/// Recovery evaluation followed by periodic snapshots toward persistence.
async fn sweep_loop(mut ctx: SweepContext) -> Result<()> {
    let mut limiter = RateLimiter::new(ctx.period);
    loop {
        tokio::select! {
            _ = ctx.shutdown.recv() => {
                debug!(target: "h2_ems::supervisor", "recovery sweep shutdown");
                break;
            }
            _ = limiter.tick() => {
                let decisions = ctx.monitor.sweep().await;
                if !decisions.is_empty() {
                    debug!(
                        target: "h2_ems::supervisor",
                        decisions = decisions.len(),
                        "recovery sweep acted"
                    );
                }
                let Some(handoff) = &ctx.handoff else {
                    continue;
                };
                let now = ctx.clock.now();
                let snapshots = ctx.registry.snapshots(&ctx.table, now, ctx.heartbeat_window);
                for snapshot in snapshots {
                    let item = PersistItem::Snapshot {
                        snapshot,
                        reason: SnapshotReason::Periodic,
                    };
                    if handoff.push(item).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn telemetry_loop(
    registry: Arc<CellRegistry>,
    table: Arc<FaultTable>,
    clock: SharedClock,
    heartbeat_window: Duration,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut limiter = RateLimiter::new(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = limiter.tick() => {
                for snapshot in registry.snapshots(&table, clock.now(), heartbeat_window) {
                    debug!(
                        target: "h2_ems::telemetry",
                        device = %snapshot.device,
                        switched_on = snapshot.switched_on,
                        run = snapshot.flags.run,
                        fault = snapshot.flags.fault,
                        power_w = snapshot.power_w,
                        volts = snapshot.volts,
                        current_a = snapshot.current_a,
                        anode_pressure_mbar = snapshot.anode_pressure_mbar,
                        outlet_temp_c = snapshot.outlet_temp_c,
                        severity = ?snapshot.severity,
                        "cell telemetry"
                    );
                }
            }
        }
    }
    Ok(())
}

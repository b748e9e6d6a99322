//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the H2-EMS daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use h2_ems_cell::{
    BusConnector, ChannelConnector, FaultTable, LoggingModuleControl, RawFrame, TracingNotifier,
};
use h2_ems_common::{init_tracing, AppConfig, SharedClock, SystemClock};
use h2_ems_core::{decode_capture, Collaborators, Supervisor};
use h2_ems_persistence::{EventLogConnector, SinkConnector};
use h2_ems_sim::{Pacing, ReplayConnector, ReplayEngine};
use prometheus::Registry;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("H2-EMS ", env!("CARGO_PKG_VERSION")),
    about = "H2-EMS fuel-cell supervisor daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Start with maintenance suppression enabled")]
    maintenance: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the supervisor")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "Print the fault definition table")]
    Faults,
    #[command(about = "Decode a bus capture offline and print the resulting snapshots")]
    Replay {
        #[arg(value_name = "CAPTURE")]
        file: PathBuf,
        #[arg(long, help = "Print the full report as JSON")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/h2-emsd.toml"));
    candidates.push(PathBuf::from("configs/h2-emsd.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("h2-emsd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, cli.maintenance).await?,
        Commands::CheckConfig => {
            println!("{}: ok", loaded.source.display());
        }
        Commands::Faults => print_fault_table(&config.faults.table)?,
        Commands::Replay { file, json } => replay_capture(&config, &file, json)?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, maintenance: bool) -> Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let table = FaultTable::load_or_empty(&config.faults.table);
    // Held for the daemon lifetime so an idle channel source never reports end of stream.
    let (connector, _idle_sender) = bus_connector(&config, clock.clone())?;

    let sink = config.persistence.enabled.then(|| {
        Arc::new(EventLogConnector::new(&config.persistence.event_log))
            as Arc<dyn SinkConnector>
    });
    let collaborators = Collaborators {
        connector,
        control: Arc::new(LoggingModuleControl::new()),
        notifier: Arc::new(TracingNotifier),
        sink,
        clock,
        metrics: Some(Arc::new(Registry::new())),
    };

    let handle = Supervisor::new(config, table, collaborators).start()?;
    if maintenance {
        warn!("maintenance suppression enabled from the command line");
        handle.controls().set_maintenance(true);
    }

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await
}

fn bus_connector(
    config: &AppConfig,
    clock: SharedClock,
) -> Result<(Arc<dyn BusConnector>, Option<mpsc::Sender<RawFrame>>)> {
    match &config.bus.replay {
        Some(path) => {
            let engine = ReplayEngine::from_path(path)?;
            info!(capture = %path.display(), frames = engine.len(), "replaying bus capture");
            let connector = ReplayConnector::new(
                path.display().to_string(),
                engine,
                Pacing::real_time(config.bus.replay_speedup),
                clock,
            );
            Ok((Arc::new(connector), None))
        }
        None => {
            warn!(bus = %config.bus.name, "no bus adapter configured; supervisor will idle");
            let (sender, connector) = ChannelConnector::new(config.bus.name.clone(), 1);
            Ok((Arc::new(connector), Some(sender)))
        }
    }
}

fn print_fault_table(path: &Path) -> Result<()> {
    let table = FaultTable::load(path)
        .with_context(|| format!("unable to load fault table {}", path.display()))?;
    println!(
        "{:<4} {:<4} {:<11} {:<7} {:<16} DESCRIPTION",
        "BANK", "BIT", "SEVERITY", "REBOOT", "TAG"
    );
    for (bank, bit, definition) in table.iter_sorted() {
        println!(
            "{:<4} {:<4} {:<11} {:<7} {:<16} {}",
            bank,
            bit,
            format!("{:?}", definition.severity),
            definition.reboot_required,
            definition.tag,
            definition.description
        );
    }
    println!("{} definitions", table.len());
    Ok(())
}

fn replay_capture(config: &AppConfig, file: &Path, json: bool) -> Result<()> {
    let engine = ReplayEngine::from_path(file)?;
    let table = FaultTable::load_or_empty(&config.faults.table);
    let report = decode_capture(&engine, &table, config, chrono::Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let counts = report.counts;
    println!(
        "frames={} decoded={} bursts={} dropped={} suppressed={}",
        counts.frames, counts.decoded, counts.bursts, counts.dropped, counts.suppressed
    );
    for snapshot in &report.snapshots {
        println!(
            "{} serial={} on={} run={} fault={} power={:.0}W volts={:.2}V current={:.2}A severity={:?} reboot={}",
            snapshot.device,
            snapshot.serial,
            snapshot.switched_on,
            snapshot.flags.run,
            snapshot.flags.fault,
            snapshot.power_w,
            snapshot.volts,
            snapshot.current_a,
            snapshot.severity,
            snapshot.reboot_required
        );
        for (bank, descriptions) in &snapshot.fault_descriptions {
            for description in descriptions {
                println!("    {bank}: {description}");
            }
        }
    }
    Ok(())
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TOML configuration model and discovery for the supervisor."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_bus_name() -> String {
    "fc-bus0".to_owned()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_watchdog_poll() -> Duration {
    Duration::from_millis(250)
}

fn default_handoff_capacity() -> usize {
    1024
}

fn default_max_restarts() -> u32 {
    3
}

fn default_fault_hold() -> Duration {
    Duration::from_secs(60)
}

fn default_clear_hold() -> Duration {
    Duration::from_secs(300)
}

fn default_power_on_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_power_on_delay_step() -> Duration {
    Duration::from_secs(10)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_heartbeat_window() -> Duration {
    Duration::from_millis(500)
}

fn default_fault_table() -> PathBuf {
    PathBuf::from("configs/faults.toml")
}

fn default_event_log() -> PathBuf {
    PathBuf::from("target/h2-ems/records.log")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_true() -> bool {
    true
}

/// Highest module id addressable on the fuel-cell bus (three identifier bits).
pub const MAX_DEVICE_ID: u8 = 7;

/// Primary configuration object for the H2-EMS supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub faults: FaultTableConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "H2_EMS_CONFIG";

    /// Load configuration from disk, respecting the `H2_EMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.bus.handoff_capacity == 0 {
            return Err(anyhow!("bus.handoff_capacity must be greater than zero"));
        }
        if self.bus.idle_timeout.is_zero() || self.bus.watchdog_poll.is_zero() {
            return Err(anyhow!("bus idle_timeout and watchdog_poll must be non-zero"));
        }
        if self.recovery.sweep_interval.is_zero() || self.telemetry.log_interval.is_zero() {
            return Err(anyhow!("sweep and telemetry log intervals must be non-zero"));
        }
        if self.telemetry.heartbeat_window.is_zero() {
            return Err(anyhow!("telemetry.heartbeat_window must be non-zero"));
        }
        let mut seen = [false; MAX_DEVICE_ID as usize + 1];
        for entry in &self.recording.devices {
            let Some(slot) = seen.get_mut(usize::from(entry.device)) else {
                return Err(anyhow!(
                    "recording.device id {} is outside 0..={}",
                    entry.device,
                    MAX_DEVICE_ID
                ));
            };
            if std::mem::replace(slot, true) {
                return Err(anyhow!(
                    "recording.device id {} is configured more than once",
                    entry.device
                ));
            }
        }
        if let Some(window) = &self.recording.window {
            if window.end <= window.start {
                return Err(anyhow!(
                    "recording window ends ({}) before it starts ({})",
                    window.end,
                    window.start
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Fuel-cell bus transport and ingestion settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_name")]
    pub name: String,
    /// Silence after which all cell telemetry is cleared.
    #[serde(default = "default_idle_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
    #[serde(default = "default_watchdog_poll")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub watchdog_poll: Duration,
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_delay: Duration,
    /// Bound of the record handoff queue; producers block when it is full.
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,
    /// Capture file replayed instead of a live adapter.
    #[serde(default)]
    pub replay: Option<PathBuf>,
    #[serde(default)]
    pub replay_speedup: Option<f64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: default_bus_name(),
            idle_timeout: default_idle_timeout(),
            watchdog_poll: default_watchdog_poll(),
            reconnect_delay: default_reconnect_delay(),
            handoff_capacity: default_handoff_capacity(),
            replay: None,
            replay_speedup: None,
        }
    }
}

/// Auto-restart throttling parameters.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Continuous fault time before a restart is attempted.
    #[serde(default = "default_fault_hold")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fault_hold: Duration,
    /// Uninterrupted fault-free time before an episode is resolved.
    #[serde(default = "default_clear_hold")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub clear_hold: Duration,
    #[serde(default = "default_power_on_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub power_on_delay: Duration,
    /// Added to the power-on delay for every prior attempt in the episode.
    #[serde(default = "default_power_on_delay_step")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub power_on_delay_step: Duration,
    #[serde(default = "default_sweep_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sweep_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            fault_hold: default_fault_hold(),
            clear_hold: default_clear_hold(),
            power_on_delay: default_power_on_delay(),
            power_on_delay_step: default_power_on_delay_step(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub log_interval: Duration,
    /// A cell counts as switched on while its last frame is younger than this.
    #[serde(default = "default_heartbeat_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_window: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_interval: default_log_interval(),
            heartbeat_window: default_heartbeat_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultTableConfig {
    #[serde(default = "default_fault_table")]
    pub table: PathBuf,
}

impl Default for FaultTableConfig {
    fn default() -> Self {
        Self {
            table: default_fault_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_log: default_event_log(),
        }
    }
}

/// Operator-controlled recording eligibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub window: Option<RecordingWindowConfig>,
    #[serde(default)]
    pub default_policy: DeviceLogPolicy,
    #[serde(default, rename = "device", alias = "devices")]
    pub devices: Vec<DeviceLogOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingWindowConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLogPolicy {
    #[serde(default)]
    pub log_on_enable: bool,
    #[serde(default)]
    pub log_on_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLogOverride {
    pub device: u8,
    #[serde(flatten)]
    pub policy: DeviceLogPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: LogFormat::default(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.bus.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.recovery.fault_hold, Duration::from_secs(60));
        assert_eq!(config.recovery.clear_hold, Duration::from_secs(300));
        assert_eq!(config.telemetry.heartbeat_window, Duration::from_millis(500));
        assert!(config.recording.window.is_none());
    }

    #[test]
    fn parses_recording_overrides() {
        let config: AppConfig = r#"
            [recovery]
            max_restarts = 2
            power_on_delay = 3

            [recording]
            default_policy = { log_on_run = true }

            [recording.window]
            start = "2026-01-01T00:00:00Z"
            end = "2026-01-01T01:00:00Z"

            [[recording.device]]
            device = 1
            log_on_enable = true
        "#
        .parse()
        .unwrap();
        assert_eq!(config.recovery.max_restarts, 2);
        assert_eq!(config.recovery.power_on_delay, Duration::from_secs(3));
        assert!(config.recording.default_policy.log_on_run);
        assert_eq!(config.recording.devices.len(), 1);
        assert_eq!(config.recording.devices[0].device, 1);
        assert!(config.recording.devices[0].policy.log_on_enable);
        assert!(config.recording.window.is_some());
    }

    #[test]
    fn rejects_inverted_window() {
        let result = r#"
            [recording.window]
            start = "2026-01-01T01:00:00Z"
            end = "2026-01-01T00:00:00Z"
        "#
        .parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_device_overrides_off_the_bus_or_repeated() {
        let out_of_range = r#"
            [[recording.devices]]
            device = 9
            log_on_run = true
        "#
        .parse::<AppConfig>();
        assert!(out_of_range.is_err());

        let repeated = r#"
            [[recording.device]]
            device = 1
            log_on_run = true

            [[recording.device]]
            device = 1
            log_on_enable = true
        "#
        .parse::<AppConfig>();
        assert!(repeated.is_err());

        let highest: AppConfig = "[[recording.device]]\ndevice = 7\n".parse().unwrap();
        assert_eq!(highest.recording.devices[0].device, MAX_DEVICE_ID);
    }

    #[test]
    fn rejects_zero_capacity() {
        let result = "[bus]\nhandoff_capacity = 0\n".parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn load_with_source_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h2.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[bus]\nname = \"fc-test\"").unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.bus.name, "fc-test");
    }
}

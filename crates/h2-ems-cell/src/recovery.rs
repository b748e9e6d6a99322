//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Hysteresis-based auto-restart state machine for fuel-cell modules."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Evaluated on a fixed-period sweep, never per frame. A restart episode runs from
//! the first fault assertion until a full, uninterrupted clear window; at most
//! `max_restarts` power cycles are issued per episode.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use h2_ems_common::{elapsed_since, RecoveryConfig, SharedClock};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actuation::ModuleControl;
use crate::demux::CellRegistry;
use crate::fault::{FaultRegisters, FaultTable};
use crate::frame::DeviceId;
use crate::notify::{Notifier, RestartNotice};
use crate::state::RecoveryBook;

/// Throttling parameters for restart episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_restarts: u32,
    /// Continuous fault time before a restart is attempted.
    pub fault_hold: Duration,
    /// Fault-free time before an episode is resolved.
    pub clear_hold: Duration,
    pub power_on_delay: Duration,
    /// Added to `power_on_delay` for every prior attempt in the episode.
    pub power_on_delay_step: Duration,
}

impl RecoveryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            fault_hold: config.fault_hold,
            clear_hold: config.clear_hold,
            power_on_delay: config.power_on_delay,
            power_on_delay_step: config.power_on_delay_step,
        }
    }

    pub fn power_on_delay_for(&self, prior_attempts: u32) -> Duration {
        self.power_on_delay
            .saturating_add(self.power_on_delay_step.saturating_mul(prior_attempts))
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

/// Derived view of a module's recovery bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Healthy,
    FaultPending,
    Restarting,
    ClearPending,
}

impl RecoveryPhase {
    pub fn of(book: &RecoveryBook, fault: bool) -> Self {
        if book.in_restart {
            RecoveryPhase::Restarting
        } else if fault && book.fault_time.is_some() {
            RecoveryPhase::FaultPending
        } else if book.clear_time.is_some() {
            RecoveryPhase::ClearPending
        } else {
            RecoveryPhase::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartAction {
    /// 1-based attempt number within the episode.
    pub attempt: u32,
    pub power_on_delay: Duration,
}

/// Result of one evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Idle,
    /// First sighting of a fault; the hold timer started.
    FaultObserved,
    /// Fault came back inside the clear window; the episode continues.
    FaultReasserted,
    Restart(RestartAction),
    /// Hold elapsed but the episode has used up its attempts.
    Throttled { attempts: u32 },
    ClearStarted,
    Resolved,
}

/// Advance one module's recovery bookkeeping.
///
/// * `fault` is the module's current fault flag.
/// * `power_on_pending` suspends evaluation while a power cycle is in progress.
pub fn evaluate(
    book: &mut RecoveryBook,
    fault: bool,
    power_on_pending: bool,
    now: DateTime<Utc>,
    policy: &RecoveryPolicy,
) -> RecoveryDecision {
    if power_on_pending {
        return RecoveryDecision::Idle;
    }

    if fault {
        if book.clear_time.take().is_some() {
            book.fault_time = Some(now);
            return RecoveryDecision::FaultReasserted;
        }
        let Some(fault_time) = book.fault_time else {
            book.fault_time = Some(now);
            return RecoveryDecision::FaultObserved;
        };
        if elapsed_since(now, fault_time) < policy.fault_hold {
            return RecoveryDecision::Idle;
        }
        // The next threshold crossing is measured from here.
        book.fault_time = Some(now);
        if book.restart_attempts >= policy.max_restarts {
            return RecoveryDecision::Throttled {
                attempts: book.restart_attempts,
            };
        }
        let action = RestartAction {
            attempt: book.restart_attempts + 1,
            power_on_delay: policy.power_on_delay_for(book.restart_attempts),
        };
        book.restart_attempts = action.attempt;
        book.in_restart = true;
        return RecoveryDecision::Restart(action);
    }

    // Fault flag is false and no power-on is outstanding.
    book.in_restart = false;
    match book.clear_time {
        None if book.episode_open() => {
            book.clear_time = Some(now);
            RecoveryDecision::ClearStarted
        }
        Some(cleared) if elapsed_since(now, cleared) >= policy.clear_hold => {
            *book = RecoveryBook::default();
            RecoveryDecision::Resolved
        }
        _ => RecoveryDecision::Idle,
    }
}

/// In-flight power cycles keyed by module. Each entry owns the task that powers a
/// module off, waits out the delay and powers it back on.
#[derive(Debug, Clone, Default)]
pub struct RestartTimers {
    tasks: Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
}

impl RestartTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` for `device`, aborting any cycle still pending for it.
    pub fn schedule<F>(&self, device: DeviceId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(previous) = self.tasks.lock().insert(device, handle) {
            previous.abort();
        }
    }

    pub fn is_pending(&self, device: DeviceId) -> bool {
        let mut tasks = self.tasks.lock();
        let finished = match tasks.get(&device) {
            Some(handle) => handle.is_finished(),
            None => return false,
        };
        if finished {
            tasks.remove(&device);
        }
        !finished
    }

    pub fn cancel(&self, device: DeviceId) -> bool {
        match self.tasks.lock().remove(&device) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Abort every pending cycle. Returns how many were still running.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        drained
            .into_iter()
            .filter(|(_, handle)| {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            })
            .count()
    }
}

/// Drives [`evaluate`] over every known module and performs the side effects.
pub struct RecoveryMonitor {
    registry: Arc<CellRegistry>,
    table: Arc<FaultTable>,
    policy: RecoveryPolicy,
    control: Arc<dyn ModuleControl>,
    notifier: Arc<dyn Notifier>,
    timers: RestartTimers,
    clock: SharedClock,
}

impl std::fmt::Debug for RecoveryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryMonitor")
            .field("policy", &self.policy)
            .field("cells", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RecoveryMonitor {
    pub fn new(
        registry: Arc<CellRegistry>,
        table: Arc<FaultTable>,
        policy: RecoveryPolicy,
        control: Arc<dyn ModuleControl>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            table,
            policy,
            control,
            notifier,
            timers: RestartTimers::new(),
            clock,
        }
    }

    pub fn timers(&self) -> &RestartTimers {
        &self.timers
    }

    /// One sweep over all modules. Returns the decisions that were not idle.
    pub async fn sweep(&self) -> Vec<(DeviceId, RecoveryDecision)> {
        let now = self.clock.now();
        let mut decisions = Vec::new();
        for handle in self.registry.handles() {
            let device = handle.device();
            let pending = self.timers.is_pending(device);
            let (decision, faults) = handle.with_state(|state| {
                let fault = state.fault_active();
                let decision = evaluate(&mut state.recovery, fault, pending, now, &self.policy);
                (decision, state.faults)
            });
            if decision == RecoveryDecision::Idle {
                continue;
            }
            self.act(device, decision, faults, now).await;
            decisions.push((device, decision));
        }
        decisions
    }

    async fn act(
        &self,
        device: DeviceId,
        decision: RecoveryDecision,
        faults: FaultRegisters,
        now: DateTime<Utc>,
    ) {
        match decision {
            RecoveryDecision::Idle => {}
            RecoveryDecision::FaultObserved => warn!(
                target: "h2_ems::recovery",
                %device,
                fault_a = %format!("{:#010x}", faults.a),
                fault_b = %format!("{:#010x}", faults.b),
                fault_c = %format!("{:#010x}", faults.c),
                fault_d = %format!("{:#010x}", faults.d),
                hold_s = self.policy.fault_hold.as_secs(),
                "fault observed; restart hold started"
            ),
            RecoveryDecision::FaultReasserted => warn!(
                target: "h2_ems::recovery",
                %device,
                "fault reasserted inside clear window; episode continues"
            ),
            RecoveryDecision::Throttled { attempts } => warn!(
                target: "h2_ems::recovery",
                %device,
                attempts,
                max_restarts = self.policy.max_restarts,
                "restart limit reached; module left faulted"
            ),
            RecoveryDecision::ClearStarted => debug!(
                target: "h2_ems::recovery",
                %device,
                "fault cleared; clear window started"
            ),
            RecoveryDecision::Resolved => info!(
                target: "h2_ems::recovery",
                %device,
                "restart episode resolved"
            ),
            RecoveryDecision::Restart(action) => self.restart(device, action, faults, now).await,
        }
    }

    async fn restart(
        &self,
        device: DeviceId,
        action: RestartAction,
        faults: FaultRegisters,
        now: DateTime<Utc>,
    ) {
        warn!(
            target: "h2_ems::recovery",
            %device,
            attempt = action.attempt,
            max_restarts = self.policy.max_restarts,
            power_on_delay_s = action.power_on_delay.as_secs(),
            "restarting fuel-cell module"
        );

        let control = Arc::clone(&self.control);
        let delay = action.power_on_delay;
        self.timers.schedule(device, async move {
            let intent = control.intent(device).await;
            if let Err(err) = control.power_off(device).await {
                warn!(target: "h2_ems::recovery", %device, error = %err, "power off failed");
            }
            tokio::time::sleep(delay).await;
            match control.power_on(device, intent).await {
                Ok(()) => info!(target: "h2_ems::recovery", %device, "module powered on"),
                Err(err) => warn!(
                    target: "h2_ems::recovery",
                    %device,
                    error = %err,
                    "power on failed"
                ),
            }
        });

        let notice = RestartNotice {
            device,
            attempt: action.attempt,
            max_attempts: self.policy.max_restarts,
            severity: self.table.resolve(&faults).severity,
            faults: self.table.describe(&faults),
            issued_at: now,
        };
        if let Err(err) = self.notifier.notify(&notice).await {
            warn!(target: "h2_ems::recovery", %device, error = %err, "restart notification failed");
        }
    }

    /// Abort every pending power cycle. Called on shutdown.
    pub fn shutdown(&self) {
        let aborted = self.timers.cancel_all();
        if aborted > 0 {
            warn!(target: "h2_ems::recovery", aborted, "pending power cycles cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn policy(max_restarts: u32) -> RecoveryPolicy {
        RecoveryPolicy {
            max_restarts,
            ..RecoveryPolicy::default()
        }
    }

    #[test]
    fn power_on_delay_grows_per_attempt() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.power_on_delay_for(0), Duration::from_secs(10));
        assert_eq!(policy.power_on_delay_for(2), Duration::from_secs(30));
    }

    #[test]
    fn throttles_after_max_restarts() {
        let policy = policy(2);
        let mut book = RecoveryBook::default();

        assert_eq!(
            evaluate(&mut book, true, false, at(0), &policy),
            RecoveryDecision::FaultObserved
        );
        assert_eq!(evaluate(&mut book, true, false, at(59), &policy), RecoveryDecision::Idle);

        let first = evaluate(&mut book, true, false, at(60), &policy);
        assert_eq!(
            first,
            RecoveryDecision::Restart(RestartAction {
                attempt: 1,
                power_on_delay: Duration::from_secs(10)
            })
        );
        assert!(book.in_restart);

        // Power cycle in progress.
        assert_eq!(evaluate(&mut book, true, true, at(65), &policy), RecoveryDecision::Idle);
        assert_eq!(evaluate(&mut book, true, false, at(100), &policy), RecoveryDecision::Idle);

        let second = evaluate(&mut book, true, false, at(120), &policy);
        assert_eq!(
            second,
            RecoveryDecision::Restart(RestartAction {
                attempt: 2,
                power_on_delay: Duration::from_secs(20)
            })
        );

        let third = evaluate(&mut book, true, false, at(180), &policy);
        assert_eq!(third, RecoveryDecision::Throttled { attempts: 2 });
        assert_eq!(book.restart_attempts, 2);
        assert_eq!(
            evaluate(&mut book, true, false, at(240), &policy),
            RecoveryDecision::Throttled { attempts: 2 }
        );
    }

    #[test]
    fn reassertion_inside_clear_window_keeps_attempts() {
        let policy = policy(3);
        let mut book = RecoveryBook::default();
        evaluate(&mut book, true, false, at(0), &policy);
        evaluate(&mut book, true, false, at(60), &policy);
        assert_eq!(book.restart_attempts, 1);

        assert_eq!(
            evaluate(&mut book, false, false, at(80), &policy),
            RecoveryDecision::ClearStarted
        );
        assert!(!book.in_restart);
        assert_eq!(
            evaluate(&mut book, false, false, at(80 + 239), &policy),
            RecoveryDecision::Idle
        );

        // Four minutes into the window the fault is back.
        assert_eq!(
            evaluate(&mut book, true, false, at(80 + 240), &policy),
            RecoveryDecision::FaultReasserted
        );
        assert_eq!(book.restart_attempts, 1);
        assert!(book.clear_time.is_none());
        assert_eq!(book.fault_time, Some(at(320)));

        assert_eq!(
            evaluate(&mut book, false, false, at(330), &policy),
            RecoveryDecision::ClearStarted
        );
        assert_eq!(
            evaluate(&mut book, false, false, at(330 + 299), &policy),
            RecoveryDecision::Idle
        );
        assert_eq!(book.restart_attempts, 1);
        assert_eq!(
            evaluate(&mut book, false, false, at(330 + 300), &policy),
            RecoveryDecision::Resolved
        );
        assert_eq!(book, RecoveryBook::default());
    }

    #[test]
    fn healthy_module_stays_idle() {
        let policy = RecoveryPolicy::default();
        let mut book = RecoveryBook::default();
        for secs in 0..10 {
            assert_eq!(
                evaluate(&mut book, false, false, at(secs), &policy),
                RecoveryDecision::Idle
            );
        }
        assert!(book.clear_time.is_none());
    }

    #[test]
    fn resolved_episode_starts_fresh() {
        let policy = policy(1);
        let mut book = RecoveryBook::default();
        evaluate(&mut book, true, false, at(0), &policy);
        evaluate(&mut book, true, false, at(60), &policy);
        evaluate(&mut book, false, false, at(100), &policy);
        assert_eq!(evaluate(&mut book, false, false, at(400), &policy), RecoveryDecision::Resolved);
        assert_eq!(
            evaluate(&mut book, true, false, at(401), &policy),
            RecoveryDecision::FaultObserved
        );
        assert!(matches!(
            evaluate(&mut book, true, false, at(461), &policy),
            RecoveryDecision::Restart(RestartAction { attempt: 1, .. })
        ));
    }

    #[test]
    fn phase_reflects_bookkeeping() {
        let mut book = RecoveryBook::default();
        assert_eq!(RecoveryPhase::of(&book, false), RecoveryPhase::Healthy);
        book.fault_time = Some(at(0));
        assert_eq!(RecoveryPhase::of(&book, true), RecoveryPhase::FaultPending);
        book.in_restart = true;
        assert_eq!(RecoveryPhase::of(&book, true), RecoveryPhase::Restarting);
        book.in_restart = false;
        book.clear_time = Some(at(1));
        assert_eq!(RecoveryPhase::of(&book, false), RecoveryPhase::ClearPending);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_cancel_pending_cycles() {
        let timers = RestartTimers::new();
        let device = DeviceId::new(1);
        timers.schedule(device, tokio::time::sleep(Duration::from_secs(30)));
        tokio::task::yield_now().await;
        assert!(timers.is_pending(device));
        assert!(timers.cancel(device));
        assert!(!timers.is_pending(device));

        timers.schedule(device, tokio::time::sleep(Duration::from_secs(30)));
        timers.schedule(DeviceId::new(2), async {});
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!timers.is_pending(DeviceId::new(2)));
        assert_eq!(timers.cancel_all(), 1);
    }
}

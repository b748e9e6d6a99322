//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixed-period rate limiter and tracked task group."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Fixed-period ticker. A late tick pushes later ticks back instead of bursting
/// to catch up, so a slow sweep never runs twice in a row.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    interval: tokio::time::Interval,
}

impl RateLimiter {
    /// The first tick completes immediately.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { period, interval }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Named long-running tasks of one supervisor instance.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        debug!(target: "h2_ems::rt", task = name, "spawning task");
        self.tasks.push((name, tokio::spawn(fut)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task. All tasks are joined even when one fails; the first
    /// failure is returned.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (name, task) in self.tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(err) => Err(anyhow!("task join failure: {}", err)),
            };
            if let Err(err) = outcome {
                error!(target: "h2_ems::rt", task = name, error = %err, "task failed");
                first_error.get_or_insert(err.context(format!("task {name} failed")));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn abort_all(&self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_ticks_on_period() {
        let mut limiter = RateLimiter::new(Duration::from_millis(200));
        let first = limiter.tick().await;
        let second = limiter.tick().await;
        assert_eq!(second - first, Duration::from_millis(200));
        assert_eq!(limiter.period(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn task_group_reports_first_failure() {
        let mut group = TaskGroup::new();
        group.spawn("ok", async { Ok(()) });
        group.spawn("broken", async { Err(anyhow!("sink gone")) });
        assert_eq!(group.len(), 2);
        let err = group.join().await.unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
    }
}

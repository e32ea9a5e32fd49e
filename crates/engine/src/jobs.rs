//! Background jobs.
//!
//! The reconciler runs on a fixed interval and the pruner once a day at the
//! configured wall-clock time. Both are owned by the [`Engine`] that started
//! them and stop when the returned [`Jobs`] handle is dropped or stopped.

use std::time::Duration;

use time::{OffsetDateTime, Time};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::Engine;

/// Handle over the running background jobs.
pub struct Jobs {
    handles: Vec<JoinHandle<()>>,
}

impl Jobs {
    /// Stop every job.
    pub fn stop(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for Jobs {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Parse a `HH:MM` schedule string.
fn parse_schedule(value: &str) -> Option<Time> {
    let (hour, minute) = value.split_once(':')?;

    Time::from_hms(hour.parse().ok()?, minute.parse().ok()?, 0).ok()
}

/// Time left until the next daily occurrence of `at`.
fn until_next(now: OffsetDateTime, at: Time) -> Duration {
    let mut target = now.replace_time(at);

    if target <= now {
        target += time::Duration::days(1);
    }

    (target - now).unsigned_abs()
}

impl Engine {
    /// Start the lifecycle reconciler and the daily pruner.
    pub fn start_jobs(&self) -> Jobs {
        let reconciler = {
            let engine = self.clone();

            tokio::spawn(async move { engine.reconcile_loop().await })
        };

        let pruner = {
            let engine = self.clone();

            tokio::spawn(async move { engine.prune_loop().await })
        };

        Jobs {
            handles: vec![reconciler, pruner],
        }
    }

    async fn reconcile_loop(self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.reconcile_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval = self.config.reconcile_interval,
            "lifecycle reconciler started"
        );

        loop {
            ticker.tick().await;

            if let Err(err) = self.reconcile().await {
                error!(%err, "reconciliation pass failed");
            }
        }
    }

    async fn prune_loop(self) {
        let at = match parse_schedule(&self.config.prune_at) {
            Some(at) => at,
            None => {
                warn!(
                    schedule = %self.config.prune_at,
                    "invalid prune schedule, daily pruning disabled"
                );
                return;
            }
        };

        info!(schedule = %self.config.prune_at, "pruner scheduled");

        loop {
            let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());

            tokio::time::sleep(until_next(now, at)).await;

            match self.prune_all_untagged().await {
                Ok(summary) => {
                    info!(
                        total = summary.total_found,
                        succeeded = summary.success_count,
                        failed = summary.error_count,
                        "scheduled prune finished"
                    );
                }
                Err(err) => error!(%err, "scheduled prune failed"),
            }
        }
    }
}

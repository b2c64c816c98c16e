//! Scheduler (§4.9): runs the Migration and Cleanup engines on cron
//! expressions, suppressing overlapping runs and never catching up missed
//! fires after downtime.
//!
//! Grounded on the `cron` crate usage pattern seen across
//! `examples/blockscout-blockscout-rs`'s service crates (a `Schedule`
//! parsed once, `upcoming(Utc)` driving a sleep-until-fire loop).

use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::StorageError;

pub struct Scheduler {
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> (Self, tokio::sync::watch::Receiver<bool>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (Self { shutdown: tx }, rx)
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Spawns the sleep-until-fire loop for one named task. `run` is called
    /// with no overlap: if the previous invocation has not finished when
    /// the next fire time arrives, that fire is skipped and logged rather
    /// than queued. Because the next fire time is always computed from the
    /// current wall clock (never from a stored "last run" timestamp), a
    /// long process pause never produces a burst of catch-up runs.
    pub fn spawn_task<F, Fut>(
        &self,
        name: &'static str,
        cron_expr: &str,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        run: F,
    ) -> Result<JoinHandle<()>, StorageError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| StorageError::ConfigInvalid(format!("invalid cron expression for {name}: {e}")))?;
        let in_flight = Arc::new(AtomicBool::new(false));

        Ok(tokio::spawn(async move {
            loop {
                let next_fire = match schedule.upcoming(chrono::Utc).next() {
                    Some(t) => t,
                    None => {
                        warn!(task = name, "cron schedule has no future fire time; stopping");
                        return;
                    }
                };
                let now = chrono::Utc::now();
                let sleep_for = (next_fire - now).to_std().unwrap_or(std::time::Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(task = name, "scheduler task stopping");
                            return;
                        }
                    }
                }
                if *shutdown.borrow() {
                    return;
                }

                if in_flight.swap(true, Ordering::SeqCst) {
                    warn!(task = name, "previous run still in flight; skipping this fire");
                    continue;
                }

                info!(task = name, "firing scheduled task");
                run().await;
                in_flight.store(false, Ordering::SeqCst);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_cron_expression() {
        let (scheduler, rx) = Scheduler::new();
        let result = scheduler.spawn_task("bad", "not a cron expr", rx, || async {});
        assert!(result.is_err());
    }
}

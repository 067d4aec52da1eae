//! Periodic background cleanup.
//!
//! Sweeps are throughput optimizations only; every read path evaluates expiry
//! itself, so a stopped or failing sweeper never affects correctness.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{AuthError, LOG_TARGET};

/// Stop signal for a running sweeper. Dropping the handle also stops it.
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals the task and waits for the in-flight pass to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!(target: LOG_TARGET, "msg=\"sweeper task ended abnormally\", error={e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `pass` every `interval` until cancelled. The first pass runs one
/// interval after spawning.
pub(crate) fn spawn<F, Fut>(name: &'static str, interval: Duration, mut pass: F) -> SweeperHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), AuthError>> + Send + 'static,
{
    // tokio::time::interval panics on zero
    let interval = interval.max(Duration::from_millis(1));
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately once
        ticker.tick().await;

        log::info!(
            target: LOG_TARGET,
            "msg=\"sweeper started\", sweeper={name}, interval_secs={}",
            interval.as_secs()
        );

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = pass().await {
                        log::error!(
                            target: LOG_TARGET,
                            "msg=\"sweep failed\", sweeper={name}, error={e}"
                        );
                    }
                }
            }
        }

        log::info!(target: LOG_TARGET, "msg=\"sweeper stopped\", sweeper={name}");
    });

    SweeperHandle {
        cancel,
        task: Some(task),
    }
}

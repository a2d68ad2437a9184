//! Background eviction of idle keys.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::Sweep;

/// Handle to a running sweep task.
///
/// Dropping the handle cancels the task; [`SweeperHandle::stop`] also waits
/// for it to finish.
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl SweeperHandle {
    /// Ask the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait until it has exited.
    pub async fn stop(self) {
        let SweeperHandle { token, task, _guard } = self;
        token.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

/// Spawn a task calling `target.sweep()` every `period` until cancelled.
///
/// The first sweep happens one full period after spawning. A period too
/// long to schedule leaves the task waiting for cancellation only. Must be
/// called from within a tokio runtime.
///
/// # Panics
///
/// Panics if `period` is zero.
pub fn spawn_sweeper<S>(target: Arc<S>, period: Duration) -> SweeperHandle
where
    S: Sweep + ?Sized + 'static,
{
    let token = CancellationToken::new();
    let shutdown = token.clone();

    let task = tokio::spawn(async move {
        info!(period_ms = period.as_millis() as u64, "Idle key sweeper started");

        let Some(start) = Instant::now().checked_add(period) else {
            warn!(period_secs = period.as_secs(), "Sweep period out of range, sweeper idle");
            shutdown.cancelled().await;
            return;
        };
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = target.sweep();
                    debug!(evicted, "Idle key sweep finished");
                }
                _ = shutdown.cancelled() => {
                    info!("Idle key sweeper shutting down");
                    break;
                }
            }
        }
    });

    SweeperHandle {
        _guard: token.clone().drop_guard(),
        token,
        task,
    }
}

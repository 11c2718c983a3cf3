//! Proactive refresh timer
//!
//! Holds at most one pending task. Scheduling always aborts the previous task
//! first, so a timer armed for superseded credentials never fires.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::constants::{MIN_REFRESH_SECS, REFRESH_MARGIN_SECS};
use crate::lock;

/// Delay before proactively refreshing a token that expires in
/// `expires_in_secs`: `max(expires_in - 60, 10)` seconds.
pub fn refresh_delay(expires_in_secs: u64) -> Duration {
    Duration::from_secs(
        expires_in_secs
            .saturating_sub(REFRESH_MARGIN_SECS)
            .max(MIN_REFRESH_SECS),
    )
}

struct Pending {
    task: JoinHandle<()>,
    deadline: Instant,
}

/// Single-slot cancellable timer.
#[derive(Default)]
pub struct RefreshTimer {
    pending: Mutex<Option<Pending>>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for a token expiring in `expires_in_secs`, replacing any
    /// pending timer.
    pub fn schedule<F, Fut>(&self, expires_in_secs: u64, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule_after(refresh_delay(expires_in_secs), on_fire);
    }

    /// Arm the timer to fire after `delay`, replacing any pending timer.
    pub fn schedule_after<F, Fut>(&self, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            previous.task.abort();
        }
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire().await;
        });
        *pending = Some(Pending { task, deadline });
        debug!(delay_secs = delay.as_secs(), "proactive refresh scheduled");
    }

    /// Abort the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match lock(&self.pending).take() {
            Some(previous) => {
                let was_pending = !previous.task.is_finished();
                previous.task.abort();
                if was_pending {
                    debug!("proactive refresh cancelled");
                }
                was_pending
            }
            None => false,
        }
    }

    /// When the pending timer will fire. `None` once it has fired or been cancelled.
    pub fn deadline(&self) -> Option<Instant> {
        lock(&self.pending)
            .as_ref()
            .filter(|p| !p.task.is_finished())
            .map(|p| p.deadline)
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline().is_some()
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        if let Some(previous) = lock(&self.pending).take() {
            previous.task.abort();
        }
    }
}

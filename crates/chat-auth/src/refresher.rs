//! Single-flight gate for token refresh
//!
//! The first caller starts the refresh in a detached task and every caller
//! that arrives while it runs awaits the same outcome through a watch
//! channel. Only one backend refresh can be outstanding per gate, so a
//! single-use rotating refresh token is never spent twice.
//!
//! The work runs detached so that cancelling one waiter (e.g. a request
//! dropped by its caller) does not cancel the refresh others depend on.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

use crate::lock;

/// What started a refresh. Used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Timer fired ahead of expiry
    Proactive,
    /// A request was rejected with 401
    Reactive,
    /// Explicit call by the embedding application
    Manual,
}

impl RefreshTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshTrigger::Proactive => "proactive",
            RefreshTrigger::Reactive => "reactive",
            RefreshTrigger::Manual => "manual",
        }
    }
}

enum RefreshState {
    Idle,
    Refreshing(watch::Receiver<Option<bool>>),
}

/// Resets the gate when the refresh task finishes, including by panic.
struct ResetOnDrop(Arc<Mutex<RefreshState>>);

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        *lock(&self.0) = RefreshState::Idle;
    }
}

/// Coalesces concurrent refresh requests into one in-flight operation.
pub struct SingleFlight {
    state: Arc<Mutex<RefreshState>>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*lock(&self.state), RefreshState::Refreshing(_))
    }

    /// Run `start()` unless a run is already in flight, and return the
    /// outcome of whichever run this caller ends up sharing.
    ///
    /// `start` is only invoked by the caller that opens the flight; it must
    /// not block since it runs under the gate lock.
    pub async fn run<F, Fut>(&self, start: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut outcome = {
            let mut state = lock(&self.state);
            match &*state {
                RefreshState::Refreshing(rx) => {
                    debug!("refresh already in flight, awaiting shared outcome");
                    rx.clone()
                }
                RefreshState::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *state = RefreshState::Refreshing(rx.clone());
                    let reset = ResetOnDrop(self.state.clone());
                    let work = start();
                    tokio::spawn(async move {
                        let result = work.await;
                        // Publish before reopening the gate: a caller that
                        // slips in between joins this run and sees the result.
                        let _ = tx.send(Some(result));
                        drop(reset);
                    });
                    rx
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(result) => (*result).unwrap_or(false),
            // Sender dropped without publishing: the refresh task panicked.
            Err(_) => false,
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn slow_work(
        calls: &Arc<AtomicUsize>,
        result: bool,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = bool> + Send>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                result
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let flight = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c, d) = tokio::join!(
            flight.run(slow_work(&calls, true)),
            flight.run(slow_work(&calls, true)),
            flight.run(slow_work(&calls, true)),
            flight.run(slow_work(&calls, true)),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one run must start");
        assert!(a && b && c && d);
        assert!(!flight.is_refreshing());
    }

    #[tokio::test]
    async fn all_callers_observe_the_same_failure() {
        let flight = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        // Joiners pass `true` work that must never run.
        let (a, b, c) = tokio::join!(
            flight.run(slow_work(&calls, false)),
            flight.run(slow_work(&calls, true)),
            flight.run(slow_work(&calls, true)),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!((a, b, c), (false, false, false));
    }

    #[tokio::test]
    async fn sequential_calls_start_new_runs() {
        let flight = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(flight.run(slow_work(&calls, true)).await);
        assert!(!flight.run(slow_work(&calls, false)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_run_resolves_false_and_reopens_gate() {
        let flight = SingleFlight::new();

        let blow_up = || -> bool { panic!("refresh task blew up") };
        let outcome = flight
            .run(move || async move {
                tokio::task::yield_now().await;
                blow_up()
            })
            .await;
        assert!(!outcome);
        assert!(!flight.is_refreshing());

        let calls = Arc::new(AtomicUsize::new(0));
        assert!(flight.run(slow_work(&calls, true)).await);
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_cancel_the_run() {
        let flight = SingleFlight::new();
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        let leader_calls = calls.clone();
        let leader = flight.run(move || {
            leader_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.store(true, Ordering::SeqCst);
                true
            }
        });
        // Drop the leader's wait almost immediately
        let timed_out = tokio::time::timeout(Duration::from_millis(5), leader).await;
        assert!(timed_out.is_err());
        assert!(flight.is_refreshing());

        // A later caller joins the still-running flight
        assert!(flight.run(slow_work(&calls, false)).await);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

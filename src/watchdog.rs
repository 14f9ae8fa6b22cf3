//! Deadline supervisor: forces the process down when the poll loop stalls.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::error;

/// Exit code used when the deadline lapses, distinct from startup
/// failures so a supervisor can tell a hang from a bad configuration.
pub const WATCHDOG_EXIT_CODE: i32 = 75;

/// Handle for re-arming the supervisor task.
///
/// Dropping the handle does not cancel supervision: a loop that stops
/// re-arming is exactly the failure being guarded against, so the last
/// deadline is allowed to lapse and fire.
pub struct Watchdog {
    timeout: Duration,
    deadline_tx: watch::Sender<Instant>,
}

impl Watchdog {
    /// Spawn the supervisor. On expiry it logs a backtrace and terminates
    /// the process with [`WATCHDOG_EXIT_CODE`].
    pub fn spawn(timeout: Duration) -> Self {
        Self::with_action(timeout, move || {
            let backtrace = std::backtrace::Backtrace::force_capture();
            error!(
                "No watchdog re-arm within {:?}, terminating\n{}",
                timeout, backtrace
            );
            std::process::exit(WATCHDOG_EXIT_CODE);
        })
    }

    /// Spawn with a custom expiry action, so tests can observe firing
    /// without taking the test process down.
    fn with_action<F>(timeout: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (deadline_tx, mut deadline_rx) = watch::channel(Instant::now() + timeout);

        tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            // Handle dropped: no re-arms can come any more,
                            // let the current deadline run out.
                            tokio::time::sleep_until(deadline).await;
                            break;
                        }
                    }
                }
            }
            action();
        });

        Self {
            timeout,
            deadline_tx,
        }
    }

    /// Push the deadline out by the configured timeout.
    ///
    /// Called at the top of every poll iteration, before anything that
    /// can block. Never blocks and never fails: a send error means the
    /// supervisor already fired and the process is exiting.
    pub fn arm(&self) {
        let _ = self.deadline_tx.send(Instant::now() + self.timeout);
    }
}

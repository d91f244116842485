//! Liveness monitor.
//!
//! Periodically fires a caller-supplied ping action and watches for
//! the acknowledgment clock to go stale. The two signals are
//! deliberately separate: a failed ping send is soft (it just doesn't
//! reset the clock), and only the timeout check decides the connection
//! is dead.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Cheaply cloneable handle to the liveness subsystem.
///
/// Clones share state, so the ping action can call
/// [`on_pong`](Self::on_pong) on its own clone after a successful
/// acknowledgment.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    interval: Duration,
    timeout: Duration,
    running: AtomicBool,
    /// Latch so the timeout action fires once per stall, not on every
    /// tick until someone reacts.
    timed_out: AtomicBool,
    last_pong: Mutex<Instant>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval,
                timeout,
                running: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                last_pong: Mutex::new(Instant::now()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the periodic check. Every `interval`: if more than
    /// `interval + timeout` has passed since the last acknowledgment,
    /// fire `timeout_action` (once) and skip the ping; otherwise fire
    /// `ping_action`. A panic inside either action is caught and
    /// logged; the schedule keeps ticking.
    ///
    /// Starting an already-running monitor logs and returns.
    pub fn start<P, F, T>(&self, ping_action: P, timeout_action: T)
    where
        P: Fn() -> F + Send + Sync + 'static,
        F: std::future::Future<Output = ()> + Send + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("heartbeat already running");
            return;
        }

        *self.shared.last_pong.lock() = Instant::now();
        self.shared.timed_out.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + shared.interval, shared.interval);
            loop {
                ticker.tick().await;
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }

                let elapsed = shared.last_pong.lock().elapsed();
                if elapsed > shared.interval + shared.timeout {
                    if !shared.timed_out.swap(true, Ordering::SeqCst) {
                        tracing::warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            "liveness timeout, no acknowledgment"
                        );
                        if std::panic::catch_unwind(AssertUnwindSafe(&timeout_action)).is_err() {
                            tracing::error!("heartbeat timeout action panicked");
                        }
                    }
                    continue;
                }

                tracing::trace!("sending liveness ping");
                if AssertUnwindSafe(ping_action()).catch_unwind().await.is_err() {
                    tracing::error!("heartbeat ping action panicked");
                }
            }
        });
        *self.shared.task.lock() = Some(handle);

        tracing::debug!(
            interval_ms = self.shared.interval.as_millis() as u64,
            timeout_ms = self.shared.timeout.as_millis() as u64,
            "heartbeat started"
        );
    }

    /// Record an acknowledgment. Call only after a ping actually
    /// succeeded — a failed send must not reset the clock.
    pub fn on_pong(&self) {
        *self.shared.last_pong.lock() = Instant::now();
        self.shared.timed_out.store(false, Ordering::SeqCst);
        tracing::trace!("liveness acknowledgment received");
    }

    /// Cancel the periodic check. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
        tracing::debug!("heartbeat stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn last_pong(&self) -> Instant {
        *self.shared.last_pong.lock()
    }
}

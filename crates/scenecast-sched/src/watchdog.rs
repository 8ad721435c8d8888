//! Worker liveness reporting
//!
//! Workers call [`AliveTracker::notify_alive`] on every loop iteration. Once
//! every registered worker has checked in, the tracker forwards a single
//! notification to the installed [`WatchdogNotifier`] and starts a new round.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// External watchdog fed by the pool
pub trait WatchdogNotifier: Send + Sync {
    fn register_thread(&self, component: &str);
    fn notify_thread(&self, component: &str);
    fn unregister_thread(&self, component: &str);
}

/// Aggregates per-worker liveness into pool-level watchdog notifications
pub struct AliveTracker {
    component: String,
    notifier: Option<Arc<dyn WatchdogNotifier>>,
    interval: Duration,
    alive: Mutex<Vec<bool>>,
}

impl AliveTracker {
    pub fn new(
        component: impl Into<String>,
        workers: usize,
        notifier: Option<Arc<dyn WatchdogNotifier>>,
        interval: Duration,
    ) -> Self {
        AliveTracker {
            component: component.into(),
            notifier,
            interval,
            alive: Mutex::new(vec![false; workers]),
        }
    }

    pub fn register(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.register_thread(&self.component);
        }
    }

    pub fn unregister(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.unregister_thread(&self.component);
        }
    }

    /// Record that `worker` is alive
    pub fn notify_alive(&self, worker: usize) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let round_complete = {
            let mut alive = self.alive.lock();
            if let Some(slot) = alive.get_mut(worker) {
                *slot = true;
            }
            if alive.iter().all(|a| *a) {
                alive.iter_mut().for_each(|a| *a = false);
                true
            } else {
                false
            }
        };
        if round_complete {
            notifier.notify_thread(&self.component);
        }
    }

    /// How long a worker may block on the queue before reporting again
    ///
    /// Half the watchdog interval, so a report always lands inside every
    /// interval. Unbounded when no watchdog is installed.
    pub fn calculate_timeout(&self) -> Option<Duration> {
        self.notifier.as_ref().map(|_| self.interval / 2)
    }

    pub fn has_watchdog(&self) -> bool {
        self.notifier.is_some()
    }
}

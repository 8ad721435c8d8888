//! Fixed-size worker pool
//!
//! Each worker loops: report liveness, pop with the watchdog timeout,
//! execute and release the task, repeat until cancelled. Shutdown raises
//! the cancellation flag, pushes one wake signal per worker and joins them
//! all; tasks still queued are released without running.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use scenecast_core::{SceneCastError, SceneCastResult};
use tracing::{debug, error, info, warn};

use crate::{AliveTracker, FnTask, QueueItem, Task, TaskQueue, WatchdogNotifier};

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Thread name prefix and watchdog component name
    pub name: String,
    pub pool_size: usize,
    pub watchdog_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            name: "scenecast".into(),
            pool_size: 4,
            watchdog_interval: Duration::from_secs(1),
        }
    }
}

/// Receives task failures caught at the worker boundary
pub trait DiagnosticSink: Send + Sync {
    fn task_failed(&self, error: &SceneCastError);
}

/// Default sink: one `error!` record per failure
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn task_failed(&self, err: &SceneCastError) {
        error!(error = %err, "worker task failed");
    }
}

/// Scheduler counters
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub discarded: AtomicU64,
}

/// A running pool slot
pub struct WorkerUnit {
    pub index: usize,
    handle: JoinHandle<()>,
}

/// State moved into one worker thread
struct Worker {
    index: usize,
    queue: Arc<TaskQueue>,
    alive: Arc<AliveTracker>,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn DiagnosticSink>,
    stats: Arc<SchedulerStats>,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.index, "worker started");
        self.alive.notify_alive(self.index);
        while !self.cancel.load(Ordering::Acquire) {
            let item = self.queue.pop(self.alive.calculate_timeout());
            self.alive.notify_alive(self.index);
            match item {
                // shutdown may have begun while this worker waited in pop
                Some(QueueItem::Run(task)) if self.cancel.load(Ordering::Acquire) => {
                    self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                    task.release();
                    self.queue.task_done();
                }
                Some(QueueItem::Run(task)) => {
                    self.execute(task);
                    self.queue.task_done();
                }
                Some(QueueItem::Wake) | None => {}
            }
        }
        debug!(worker = self.index, "worker stopped");
    }

    fn execute(&self, mut task: Box<dyn Task>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.execute()));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(reason) = failure {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            self.sink.task_failed(&SceneCastError::WorkerTaskFailure {
                worker: self.index,
                reason,
            });
        }
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
        task.release();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Pool of worker threads sharing one FIFO queue
pub struct TaskScheduler {
    config: SchedulerConfig,
    queue: Arc<TaskQueue>,
    alive: Arc<AliveTracker>,
    sink: Arc<dyn DiagnosticSink>,
    cancel: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    workers: Mutex<Vec<WorkerUnit>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, watchdog: Option<Arc<dyn WatchdogNotifier>>) -> Self {
        Self::with_sink(config, watchdog, Arc::new(TracingSink))
    }

    pub fn with_sink(
        config: SchedulerConfig,
        watchdog: Option<Arc<dyn WatchdogNotifier>>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let alive = Arc::new(AliveTracker::new(
            config.name.clone(),
            config.pool_size,
            watchdog,
            config.watchdog_interval,
        ));
        TaskScheduler {
            config,
            queue: Arc::new(TaskQueue::new()),
            alive,
            sink,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers; no-op when already running
    pub fn start(&self) -> SceneCastResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        if self.config.pool_size == 0 {
            return Err(SceneCastError::InvalidConfig(
                "worker pool size must be at least 1".into(),
            ));
        }

        self.cancel.store(false, Ordering::Release);
        self.queue.set_accepting(true);
        self.alive.register();

        for index in 0..self.config.pool_size {
            let worker = Worker {
                index,
                queue: self.queue.clone(),
                alive: self.alive.clone(),
                cancel: self.cancel.clone(),
                sink: self.sink.clone(),
                stats: self.stats.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", self.config.name, index))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(WorkerUnit { index, handle }),
                Err(err) => {
                    drop(workers);
                    self.shutdown();
                    return Err(err.into());
                }
            }
        }

        info!(
            pool = %self.config.name,
            workers = self.config.pool_size,
            watchdog = self.alive.has_watchdog(),
            "task scheduler started"
        );
        Ok(())
    }

    /// Enqueue a task for exactly one worker
    pub fn submit(&self, task: Box<dyn Task>) -> SceneCastResult<()> {
        self.queue.push(task).map_err(|task| {
            task.release();
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            SceneCastError::SchedulerStopped
        })
    }

    /// Enqueue a closure
    pub fn submit_fn<F>(&self, f: F) -> SceneCastResult<()>
    where
        F: FnOnce() -> SceneCastResult<()> + Send + 'static,
    {
        self.submit(Box::new(FnTask::new(f)))
    }

    /// Stop accepting tasks and wait for the queue to run dry
    pub fn drain(&self, timeout: Duration) -> bool {
        self.queue.set_accepting(false);
        self.queue.wait_idle(timeout)
    }

    /// Cancel and join every worker; no-op when already stopped
    pub fn shutdown(&self) {
        let workers: Vec<WorkerUnit> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        self.queue.set_accepting(false);
        self.cancel.store(true, Ordering::Release);
        for _ in &workers {
            self.queue.push_wake();
        }
        for worker in workers {
            if worker.handle.join().is_err() {
                warn!(worker = worker.index, "worker thread panicked");
            }
        }

        let pending = self.queue.take_pending();
        if !pending.is_empty() {
            debug!(count = pending.len(), "releasing unexecuted tasks");
        }
        for task in pending {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            task.release();
        }

        self.alive.unregister();
        info!(pool = %self.config.name, "task scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn executed_tasks(&self) -> u64 {
        self.stats.executed.load(Ordering::Relaxed)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn discarded_tasks(&self) -> u64 {
        self.stats.discarded.load(Ordering::Relaxed)
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    fn config(size: usize) -> SchedulerConfig {
        SchedulerConfig {
            name: "test".into(),
            pool_size: size,
            watchdog_interval: Duration::from_millis(40),
        }
    }

    struct TrackedTask {
        executed: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Task for TrackedTask {
        fn execute(&mut self) -> SceneCastResult<()> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(self: Box<Self>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        let scheduler = TaskScheduler::new(config(4), None);
        scheduler.start().unwrap();

        let n = 500;
        let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..n).map(|_| AtomicUsize::new(0)).collect());
        let threads = Arc::new(Mutex::new(HashSet::new()));
        for i in 0..n {
            let counts = counts.clone();
            let threads = threads.clone();
            scheduler
                .submit_fn(move || {
                    counts[i].fetch_add(1, Ordering::SeqCst);
                    threads.lock().insert(thread::current().id());
                    Ok(())
                })
                .unwrap();
        }

        assert!(scheduler.drain(Duration::from_secs(10)));
        scheduler.shutdown();

        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(scheduler.executed_tasks(), n as u64);
        assert!(threads.lock().len() <= 4);
    }

    #[test]
    fn test_single_worker_preserves_fifo() {
        let scheduler = TaskScheduler::new(config(1), None);
        let order = Arc::new(Mutex::new(Vec::new()));
        // queued before start, run after
        for i in 0..20 {
            let order = order.clone();
            scheduler
                .submit_fn(move || {
                    order.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }
        scheduler.start().unwrap();
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_failing_tasks_do_not_kill_workers() {
        let scheduler = TaskScheduler::new(config(1), None);
        scheduler.start().unwrap();

        scheduler
            .submit_fn(|| Err(SceneCastError::InvalidConfig("boom".into())))
            .unwrap();
        scheduler.submit_fn(|| panic!("task panic")).unwrap();
        let (tx, rx) = mpsc::channel();
        scheduler
            .submit_fn(move || {
                tx.send(()).ok();
                Ok(())
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(scheduler.drain(Duration::from_secs(5)));
        assert_eq!(scheduler.failed_tasks(), 2);
        assert_eq!(scheduler.executed_tasks(), 3);
    }

    #[test]
    fn test_failures_reach_diagnostic_sink() {
        struct Collect(Mutex<Vec<String>>);
        impl DiagnosticSink for Collect {
            fn task_failed(&self, err: &SceneCastError) {
                self.0.lock().push(err.to_string());
            }
        }

        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let scheduler = TaskScheduler::with_sink(config(2), None, sink.clone());
        scheduler.start().unwrap();
        scheduler.submit_fn(|| panic!("exploded")).unwrap();
        assert!(scheduler.drain(Duration::from_secs(5)));

        let failures = sink.0.lock();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("exploded"));
    }

    #[test]
    fn test_start_and_shutdown_are_idempotent() {
        let scheduler = TaskScheduler::new(config(3), None);
        scheduler.shutdown();
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.workers.lock().len(), 3);
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.is_running());

        // restartable
        scheduler.start().unwrap();
        let (tx, rx) = mpsc::channel();
        scheduler
            .submit_fn(move || {
                tx.send(()).ok();
                Ok(())
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let scheduler = TaskScheduler::new(config(1), None);
        scheduler.start().unwrap();
        scheduler.shutdown();
        let result = scheduler.submit_fn(|| Ok(()));
        assert!(matches!(result, Err(SceneCastError::SchedulerStopped)));
        assert_eq!(scheduler.discarded_tasks(), 1);
    }

    #[test]
    fn test_shutdown_finishes_current_and_releases_pending() {
        let scheduler = TaskScheduler::new(config(1), None);
        scheduler.start().unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (unblock_tx, unblock_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        scheduler
            .submit_fn(move || {
                started_tx.send(()).ok();
                unblock_rx.recv_timeout(Duration::from_secs(5)).ok();
                f.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            scheduler
                .submit(Box::new(TrackedTask {
                    executed: executed.clone(),
                    released: released.clone(),
                }))
                .unwrap();
        }

        let unblock = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            unblock_tx.send(()).ok();
        });
        scheduler.shutdown();
        unblock.join().unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_task_popped_after_cancel_is_released() {
        let scheduler = TaskScheduler::new(config(1), None);
        scheduler.start().unwrap();
        // let the worker block in pop
        thread::sleep(Duration::from_millis(50));

        let executed = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        scheduler.cancel.store(true, Ordering::Release);
        assert!(scheduler
            .queue
            .push(Box::new(TrackedTask {
                executed: executed.clone(),
                released: released.clone(),
            }))
            .is_ok());

        let deadline = Instant::now() + Duration::from_secs(5);
        while released.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.shutdown();

        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.discarded_tasks(), 1);
        assert_eq!(scheduler.executed_tasks(), 0);
    }

    #[test]
    fn test_idle_workers_feed_watchdog() {
        #[derive(Default)]
        struct Recorder {
            registered: AtomicUsize,
            notified: AtomicUsize,
            unregistered: AtomicUsize,
        }
        impl WatchdogNotifier for Recorder {
            fn register_thread(&self, _c: &str) {
                self.registered.fetch_add(1, Ordering::SeqCst);
            }
            fn notify_thread(&self, _c: &str) {
                self.notified.fetch_add(1, Ordering::SeqCst);
            }
            fn unregister_thread(&self, _c: &str) {
                self.unregistered.fetch_add(1, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let scheduler = TaskScheduler::new(config(2), Some(recorder.clone()));
        scheduler.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.notified.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        scheduler.shutdown();

        assert!(recorder.notified.load(Ordering::SeqCst) >= 3);
        assert_eq!(recorder.registered.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.unregistered.load(Ordering::SeqCst), 1);
    }
}

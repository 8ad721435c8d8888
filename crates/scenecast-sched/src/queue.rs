//! Shared blocking task queue
//!
//! The only structure mutated by several workers at once. All access goes
//! through one mutex; `available` wakes poppers, `idle` wakes drainers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::Task;

/// What a worker pops from the queue
pub enum QueueItem {
    /// A task to execute
    Run(Box<dyn Task>),
    /// No more work: wakes one blocked worker so it can observe cancellation
    Wake,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    executing: usize,
    accepting: bool,
}

/// Multi-producer, multi-consumer FIFO
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                executing: 0,
                accepting: true,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Enqueue a task; hands it back when the queue is closed
    pub fn push(&self, task: Box<dyn Task>) -> Result<(), Box<dyn Task>> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(task);
        }
        state.items.push_back(QueueItem::Run(task));
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Enqueue a wake signal; always accepted
    pub fn push_wake(&self) {
        self.state.lock().items.push_back(QueueItem::Wake);
        self.available.notify_one();
    }

    /// Pop the next item, waiting at most `timeout` (forever when `None`)
    pub fn pop(&self, timeout: Option<Duration>) -> Option<QueueItem> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                if matches!(item, QueueItem::Run(_)) {
                    state.executing += 1;
                }
                return Some(item);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return state.items.pop_front().map(|item| {
                            if matches!(item, QueueItem::Run(_)) {
                                state.executing += 1;
                            }
                            item
                        });
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Mark a popped task as finished
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.executing = state.executing.saturating_sub(1);
        if state.executing == 0 && state.items.iter().all(|i| matches!(i, QueueItem::Wake)) {
            self.idle.notify_all();
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    /// Wait until no task is queued or executing; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let pending = state
                .items
                .iter()
                .any(|i| matches!(i, QueueItem::Run(_)));
            if !pending && state.executing == 0 {
                return true;
            }
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Remove every queued item, returning the tasks that never ran
    pub fn take_pending(&self) -> Vec<Box<dyn Task>> {
        let mut state = self.state.lock();
        state
            .items
            .drain(..)
            .filter_map(|item| match item {
                QueueItem::Run(task) => Some(task),
                QueueItem::Wake => None,
            })
            .collect()
    }

    /// Number of queued tasks (wake signals excluded)
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .items
            .iter()
            .filter(|i| matches!(i, QueueItem::Run(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

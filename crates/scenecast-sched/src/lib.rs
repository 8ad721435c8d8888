//! SceneCast Scheduler - Worker pool for blocking session I/O
//!
//! A fixed set of worker threads drains one shared FIFO queue. Workers
//! report liveness to an optional watchdog on every loop iteration and
//! never die because of a failing task.

pub mod queue;
pub mod scheduler;
pub mod task;
pub mod watchdog;

pub use queue::*;
pub use scheduler::*;
pub use task::*;
pub use watchdog::*;

//! Wall clocks used for deadline stamping and checking

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use scenecast_core::FlushTime;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> FlushTime;
}

/// Operating system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> FlushTime {
        FlushTime::from_system_time(SystemTime::now())
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<FlushTime>,
}

impl ManualClock {
    pub fn new(start: FlushTime) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    /// Start at the current system time
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    pub fn advance(&self, by: Duration) -> FlushTime {
        let mut now = self.now.lock();
        *now = *now + by;
        *now
    }

    pub fn set(&self, to: FlushTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> FlushTime {
        *self.now.lock()
    }
}

//! Wall-clock time primitives for flush deadlines
//!
//! Deadlines cross process boundaries, so they are expressed as
//! milliseconds since the UNIX epoch rather than monotonic instants.
//! "No deadline" is `Option::None`; on the wire it is encoded as zero.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FlushTime(pub u64);

impl FlushTime {
    pub const EPOCH: FlushTime = FlushTime(0);

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        FlushTime(millis)
    }

    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        FlushTime(millis)
    }

    #[inline]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        FlushTime(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Elapsed time since `earlier`, zero if `earlier` is later
    #[inline]
    pub fn duration_since(self, earlier: FlushTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Encode an optional deadline; zero stands for "none"
    #[inline]
    pub fn to_wire(deadline: Option<FlushTime>) -> u64 {
        deadline.map_or(0, |t| t.0)
    }

    #[inline]
    pub fn from_wire(raw: u64) -> Option<FlushTime> {
        if raw == 0 {
            None
        } else {
            Some(FlushTime(raw))
        }
    }
}

impl Add<Duration> for FlushTime {
    type Output = FlushTime;

    fn add(self, rhs: Duration) -> FlushTime {
        FlushTime(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub<Duration> for FlushTime {
    type Output = FlushTime;

    fn sub(self, rhs: Duration) -> FlushTime {
        self.saturating_sub(rhs)
    }
}

impl fmt::Debug for FlushTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlushTime({}ms)", self.0)
    }
}

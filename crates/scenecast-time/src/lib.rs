//! SceneCast Time - Clocks and content expiration
//!
//! Deadlines are wall-clock values produced on one machine and checked on
//! another, so every consumer-side comparison goes through a [`Clock`].
//! Tests substitute a [`ManualClock`] to step time deterministically.

pub mod clock;
pub mod expiration;

pub use clock::*;
pub use expiration::*;

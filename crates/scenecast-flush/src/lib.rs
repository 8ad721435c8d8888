//! SceneCast Flush - Ordered per-scene update streams
//!
//! Producer side: [`FlushSequencer`] stamps every flush with the next
//! sequence number of its scene. Consumer side: [`FlushReceiver`] buffers
//! out-of-order arrivals, drops duplicates and releases flushes strictly in
//! sequence. [`SceneSubscription`] ties a receiver to its provider and
//! visibility state.

pub mod receiver;
pub mod sequencer;
pub mod subscription;

pub use receiver::*;
pub use sequencer::*;
pub use subscription::*;

//! SceneCast Wire - Session message codec
//!
//! Every session message is a small envelope:
//! - Byte 0: Wire version
//! - Byte 1: Message type
//! - Bytes 2..: Type-specific body (little-endian)
//!
//! On stream transports each encoded message travels inside a
//! length-prefixed frame (see [`framing`]).

pub mod framing;
pub mod message;

pub use framing::*;
pub use message::*;

//! SceneCast Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the session:
//! - Identifiers (ParticipantId, SceneId, SequenceNumber)
//! - Participant identity and addressing
//! - Wall-clock deadlines (FlushTime)
//! - Flushes, consumer events and the error taxonomy

pub mod id;
pub mod participant;
pub mod time;
pub mod flush;
pub mod event;
pub mod error;

pub use id::*;
pub use participant::*;
pub use time::*;
pub use flush::*;
pub use event::*;
pub use error::*;

/// Session protocol version carried in every handshake
pub const PROTOCOL_VERSION: u32 = 3;

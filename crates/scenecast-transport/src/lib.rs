//! SceneCast Transport Layer - Participant addressing and payload delivery
//!
//! This crate provides:
//! - The participant registry (id -> identity/address)
//! - The [`Transport`] abstraction used by the session runtime
//! - TCP transport for real networks
//! - In-process loopback transport for single-process meshes and tests

pub mod loopback;
pub mod registry;
pub mod tcp;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use registry::*;
pub use tcp::{TcpTransport, CONNECT_TIMEOUT};

use std::sync::Arc;

use bytes::Bytes;
use scenecast_core::{ParticipantId, ParticipantIdentifier, SceneCastResult};

/// Upcalls from a transport into the session runtime
///
/// Called from transport-owned threads (TCP readers) or synchronously from
/// the sender's thread (loopback); implementations must only enqueue.
pub trait TransportHandler: Send + Sync {
    fn on_receive(&self, peer: ParticipantId, payload: Bytes);

    /// The link to `peer` went away without a local `disconnect`
    fn on_disconnected(&self, peer: ParticipantId);
}

/// Point-to-point payload delivery between participants
pub trait Transport: Send + Sync {
    fn local_identifier(&self) -> &ParticipantIdentifier;

    /// Begin accepting links and delivering payloads to `handler`
    fn start(&self, handler: Arc<dyn TransportHandler>) -> SceneCastResult<()>;

    /// Open a link to `peer`; no-op when one already exists
    fn connect(&self, peer: ParticipantId) -> SceneCastResult<()>;

    /// Deliver one payload
    ///
    /// Payloads larger than [`scenecast_wire::MAX_MESSAGE_SIZE`] are refused
    /// with `MessageTooLarge` and the link stays up.
    fn send(&self, peer: ParticipantId, payload: &[u8]) -> SceneCastResult<()>;

    /// Close the link to `peer`; the remote side observes a disconnect
    fn disconnect(&self, peer: ParticipantId);

    fn is_connected(&self, peer: ParticipantId) -> bool;

    /// Close every link and stop all transport threads
    fn shutdown(&self);
}

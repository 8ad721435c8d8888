//! SceneCast Runtime - Participants, connections and discovery
//!
//! A [`Participant`] owns one transport endpoint, a worker pool for
//! blocking I/O and a connection manager thread. It exposes the producer
//! API (publish scenes, create flushes) and the consumer API (subscribe,
//! visibility, tick-driven application and expiration checks).
//!
//! The [`DiscoveryDaemon`] is a separate role at a well-known address that
//! only exchanges participant identities.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod discovery;
pub mod logging;
pub mod manager;
pub mod outbox;
pub mod participant;

pub use config::*;
pub use connection::*;
pub use consumer::*;
pub use discovery::*;
pub use logging::*;
pub use participant::*;

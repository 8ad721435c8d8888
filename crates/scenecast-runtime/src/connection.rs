//! Per-peer connection records
//!
//! Records are owned by the connection manager thread; everything else
//! sees them through [`ConnectionInfo`] snapshots.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scenecast_core::{ParticipantId, ParticipantIdentifier};

use crate::outbox::PeerOutbox;

/// Lifecycle of one peer connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Established) | (Connecting, Closing) | (Established, Closing) | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Liveness record for one remote participant
pub struct Connection {
    pub remote: Arc<ParticipantIdentifier>,
    state: ConnectionState,
    pub created: Instant,
    pub last_alive_sent: Instant,
    pub last_alive_received: Instant,
    /// A transport link exists (dialed or accepted)
    pub link_up: bool,
    pub hello_sent: bool,
    /// A dial task is in flight
    pub dialing: bool,
    pub next_dial: Instant,
    pub outbox: Arc<PeerOutbox>,
    /// Distinguishes this record from earlier ones for the same peer
    pub generation: u64,
}

impl Connection {
    pub fn new(
        remote: Arc<ParticipantIdentifier>,
        outbox: Arc<PeerOutbox>,
        generation: u64,
        now: Instant,
    ) -> Self {
        Connection {
            remote,
            state: ConnectionState::Connecting,
            created: now,
            last_alive_sent: now,
            last_alive_received: now,
            link_up: false,
            hello_sent: false,
            dialing: false,
            next_dial: now,
            outbox,
            generation,
        }
    }

    pub fn peer(&self) -> ParticipantId {
        self.remote.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Apply a transition; returns false and leaves the state alone if it is not allowed
    pub fn transition(&mut self, to: ConnectionState) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        self.state = to;
        true
    }

    pub fn keep_alive_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_alive_received) > timeout
    }

    pub fn keep_alive_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_alive_sent) >= interval
    }

    pub fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.remote.id,
            name: self.remote.name.clone(),
            state: self.state,
            since_last_sent: now.saturating_duration_since(self.last_alive_sent),
            since_last_received: now.saturating_duration_since(self.last_alive_received),
        }
    }
}

/// Point-in-time view of one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: ParticipantId,
    pub name: String,
    pub state: ConnectionState,
    pub since_last_sent: Duration,
    pub since_last_received: Duration,
}

/// Notified on the manager thread, once per transition
pub trait ConnectionObserver: Send + Sync {
    fn participant_connected(&self, _participant: &ParticipantIdentifier) {}

    fn participant_lost(&self, _participant: ParticipantId) {}
}

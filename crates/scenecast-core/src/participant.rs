//! Participant identity and addressing

use std::fmt;
use std::net::SocketAddr;

use crate::ParticipantId;

/// Where a participant can be reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParticipantAddress {
    /// Reachable over the network transport
    Socket(SocketAddr),
    /// Reachable only through an in-process loopback hub
    Local,
}

impl ParticipantAddress {
    pub fn socket(self) -> Option<SocketAddr> {
        match self {
            ParticipantAddress::Socket(addr) => Some(addr),
            ParticipantAddress::Local => None,
        }
    }
}

impl fmt::Display for ParticipantAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantAddress::Socket(addr) => write!(f, "{}", addr),
            ParticipantAddress::Local => write!(f, "local"),
        }
    }
}

/// Immutable identity of one process in the mesh
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParticipantIdentifier {
    pub id: ParticipantId,
    pub name: String,
    pub address: ParticipantAddress,
}

impl ParticipantIdentifier {
    pub fn new(id: ParticipantId, name: impl Into<String>, address: ParticipantAddress) -> Self {
        ParticipantIdentifier {
            id,
            name: name.into(),
            address,
        }
    }

    /// Identity of the discovery daemon at a well-known address
    pub fn daemon(address: ParticipantAddress) -> Self {
        ParticipantIdentifier::new(ParticipantId::DAEMON, "discovery-daemon", address)
    }
}

impl fmt::Display for ParticipantIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}@{})", self.name, self.id, self.address)
    }
}

//! In-process loopback transport
//!
//! All participants of one process attach to a shared [`LoopbackHub`].
//! Payloads are handed to the receiver's handler synchronously on the
//! sender's thread. The hub can partition pairs of participants so tests can
//! simulate a peer that silently stops answering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use scenecast_core::{
    ParticipantAddress, ParticipantId, ParticipantIdentifier, SceneCastError, SceneCastResult,
};
use scenecast_wire::MAX_MESSAGE_SIZE;
use tracing::{debug, trace};

use crate::{Transport, TransportHandler};

type Pair = (ParticipantId, ParticipantId);

fn pair(a: ParticipantId, b: ParticipantId) -> Pair {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<ParticipantId, Option<Arc<dyn TransportHandler>>>,
    links: HashSet<Pair>,
    partitions: HashSet<Pair>,
}

/// Shared switchboard for loopback transports
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: ParticipantId) -> SceneCastResult<()> {
        let mut state = self.state.lock();
        if state.endpoints.contains_key(&id) {
            return Err(SceneCastError::InvalidConfig(format!(
                "participant {} already attached to loopback hub",
                id
            )));
        }
        state.endpoints.insert(id, None);
        Ok(())
    }

    fn attach(&self, id: ParticipantId, handler: Arc<dyn TransportHandler>) {
        self.state.lock().endpoints.insert(id, Some(handler));
    }

    fn handler(&self, id: ParticipantId) -> Option<Arc<dyn TransportHandler>> {
        self.state.lock().endpoints.get(&id).cloned().flatten()
    }

    fn link(&self, from: ParticipantId, to: ParticipantId) -> SceneCastResult<()> {
        let mut state = self.state.lock();
        if !matches!(state.endpoints.get(&to), Some(Some(_))) {
            return Err(SceneCastError::transport(to, "no such loopback endpoint"));
        }
        if state.partitions.contains(&pair(from, to)) {
            return Err(SceneCastError::transport(to, "partitioned"));
        }
        state.links.insert(pair(from, to));
        Ok(())
    }

    fn deliver(&self, from: ParticipantId, to: ParticipantId, payload: &[u8]) -> SceneCastResult<()> {
        let handler = {
            let state = self.state.lock();
            if !state.links.contains(&pair(from, to)) {
                return Err(SceneCastError::transport(to, "not connected"));
            }
            if state.partitions.contains(&pair(from, to)) {
                trace!(from = %from, to = %to, "dropping payload across partition");
                return Ok(());
            }
            match state.endpoints.get(&to) {
                Some(Some(handler)) => handler.clone(),
                _ => return Err(SceneCastError::transport(to, "endpoint detached")),
            }
        };
        handler.on_receive(from, Bytes::copy_from_slice(payload));
        Ok(())
    }

    /// Remove the link and tell the other side
    fn unlink(&self, from: ParticipantId, to: ParticipantId) {
        let removed = self.state.lock().links.remove(&pair(from, to));
        if removed {
            if let Some(handler) = self.handler(to) {
                handler.on_disconnected(from);
            }
        }
    }

    fn detach(&self, id: ParticipantId) {
        let peers: Vec<(ParticipantId, Arc<dyn TransportHandler>)> = {
            let mut state = self.state.lock();
            state.endpoints.remove(&id);
            let linked: Vec<Pair> = state
                .links
                .iter()
                .filter(|(a, b)| *a == id || *b == id)
                .copied()
                .collect();
            linked
                .into_iter()
                .filter_map(|p| {
                    state.links.remove(&p);
                    let other = if p.0 == id { p.1 } else { p.0 };
                    state
                        .endpoints
                        .get(&other)
                        .cloned()
                        .flatten()
                        .map(|h| (other, h))
                })
                .collect()
        };
        for (_, handler) in peers {
            handler.on_disconnected(id);
        }
    }

    fn is_linked(&self, a: ParticipantId, b: ParticipantId) -> bool {
        self.state.lock().links.contains(&pair(a, b))
    }

    /// Silently drop all traffic between `a` and `b`
    pub fn partition(&self, a: ParticipantId, b: ParticipantId) {
        debug!(a = %a, b = %b, "loopback partition");
        self.state.lock().partitions.insert(pair(a, b));
    }

    pub fn heal(&self, a: ParticipantId, b: ParticipantId) {
        debug!(a = %a, b = %b, "loopback partition healed");
        self.state.lock().partitions.remove(&pair(a, b));
    }

    pub fn is_attached(&self, id: ParticipantId) -> bool {
        matches!(self.state.lock().endpoints.get(&id), Some(Some(_)))
    }
}

/// Transport endpoint on a [`LoopbackHub`]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    identifier: ParticipantIdentifier,
}

impl LoopbackTransport {
    pub fn new(hub: &LoopbackHub, id: ParticipantId, name: impl Into<String>) -> SceneCastResult<Self> {
        hub.register(id)?;
        Ok(LoopbackTransport {
            hub: hub.clone(),
            identifier: ParticipantIdentifier::new(id, name, ParticipantAddress::Local),
        })
    }
}

impl Transport for LoopbackTransport {
    fn local_identifier(&self) -> &ParticipantIdentifier {
        &self.identifier
    }

    fn start(&self, handler: Arc<dyn TransportHandler>) -> SceneCastResult<()> {
        self.hub.attach(self.identifier.id, handler);
        Ok(())
    }

    fn connect(&self, peer: ParticipantId) -> SceneCastResult<()> {
        self.hub.link(self.identifier.id, peer)
    }

    fn send(&self, peer: ParticipantId, payload: &[u8]) -> SceneCastResult<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(SceneCastError::MessageTooLarge(payload.len()));
        }
        self.hub.deliver(self.identifier.id, peer, payload)
    }

    fn disconnect(&self, peer: ParticipantId) {
        self.hub.unlink(self.identifier.id, peer);
    }

    fn is_connected(&self, peer: ParticipantId) -> bool {
        self.hub.is_linked(self.identifier.id, peer)
    }

    fn shutdown(&self) {
        self.hub.detach(self.identifier.id);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.hub.detach(self.identifier.id);
    }
}

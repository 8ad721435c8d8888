//! Connection manager loop
//!
//! One thread per participant owns every connection record, the producer's
//! subscriber lists and the link to the discovery daemon. Transport
//! callbacks, finished worker tasks and API calls reach it as
//! [`ManagerEvent`]s on a single channel; keep-alive housekeeping runs on a
//! timer between events. Because all transitions happen here, each
//! connect and lost transition is observed exactly once.
//!
//! Every connection record carries a generation. Link losses reported by
//! the transport are stamped with the generation bound to the peer's link
//! at that moment, so a loss that belongs to an earlier connection never
//! tears down its successor.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use scenecast_core::{
    Flush, ParticipantId, ParticipantIdentifier, SceneCastError, SceneId, SequenceNumber,
};
use scenecast_sched::TaskScheduler;
use scenecast_transport::{ParticipantRegistry, Transport, TransportHandler};
use scenecast_wire::Message;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, ConnectionInfo, ConnectionObserver, ConnectionState};
use crate::outbox::PeerOutbox;

/// Delay before re-dialing a visible peer after a failed attempt
pub const DIAL_RETRY: Duration = Duration::from_millis(100);

/// Delay before trying to reach a lost discovery daemon again
pub const DAEMON_RETRY: Duration = Duration::from_secs(1);

/// Requests from the participant API
#[derive(Debug)]
pub enum Command {
    Publish {
        scene: SceneId,
        next_sequence: SequenceNumber,
    },
    Unpublish(SceneId),
    /// An already encoded flush; encoding happens before its sequence is consumed
    Flush {
        scene: SceneId,
        sequence: SequenceNumber,
        payload: Bytes,
    },
    Subscribe {
        scene: SceneId,
        provider: ParticipantId,
    },
    Unsubscribe {
        scene: SceneId,
        provider: ParticipantId,
    },
    AddPeer(ParticipantIdentifier),
    Disconnect(ParticipantId),
    /// Drop the connection as if the link failed; the peer stays visible
    ResetPeer { peer: ParticipantId, reason: String },
    Shutdown,
}

/// Everything the manager thread reacts to
#[derive(Debug)]
pub enum ManagerEvent {
    Received { peer: ParticipantId, payload: Bytes },
    /// `generation` is the connection bound to the link when it broke
    LinkLost { peer: ParticipantId, generation: Option<u64> },
    /// A disconnect submitted to the pool has run
    LinkClosed(ParticipantId),
    LinkUp { peer: ParticipantId, generation: u64 },
    LinkFailed { peer: ParticipantId, generation: u64, reason: String },
    SendFailed { peer: ParticipantId, generation: u64, reason: String },
    Command(Command),
}

/// Consumer-bound items produced by the manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Connected(ParticipantId),
    Lost(ParticipantId),
    Published { scene: SceneId, provider: ParticipantId },
    Unpublished { scene: SceneId, provider: ParticipantId },
    Accepted {
        scene: SceneId,
        provider: ParticipantId,
        next_sequence: SequenceNumber,
    },
    Unavailable { scene: SceneId, provider: ParticipantId },
    Flush { provider: ParticipantId, flush: Flush },
}

/// Connection generation bound to each peer's transport link
pub type LinkTable = Arc<RwLock<HashMap<ParticipantId, u64>>>;

/// Forwards transport upcalls onto the manager channel
pub struct ManagerHandler {
    events: Sender<ManagerEvent>,
    links: LinkTable,
}

impl ManagerHandler {
    pub fn new(events: Sender<ManagerEvent>) -> Self {
        ManagerHandler {
            events,
            links: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Table the manager keeps current; read when stamping link losses
    pub fn links(&self) -> LinkTable {
        self.links.clone()
    }
}

impl TransportHandler for ManagerHandler {
    fn on_receive(&self, peer: ParticipantId, payload: Bytes) {
        let _ = self.events.send(ManagerEvent::Received { peer, payload });
    }

    fn on_disconnected(&self, peer: ParticipantId) {
        let generation = self.links.read().get(&peer).copied();
        let _ = self.events.send(ManagerEvent::LinkLost { peer, generation });
    }
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub protocol_version: u32,
    pub max_queued_sends: usize,
}

/// Everything a manager needs from its participant
pub struct ManagerSetup {
    pub local: Arc<ParticipantIdentifier>,
    pub config: ManagerConfig,
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<TaskScheduler>,
    pub registry: Arc<ParticipantRegistry>,
    /// Daemon identity when discovery is configured; the link must already be up
    pub daemon: Option<Arc<ParticipantIdentifier>>,
    pub events: Sender<ManagerEvent>,
    pub inbound: Sender<Inbound>,
    pub observers: Vec<Arc<dyn ConnectionObserver>>,
    pub snapshot: Arc<RwLock<Vec<ConnectionInfo>>>,
    /// Shared with the transport's [`ManagerHandler`]
    pub links: LinkTable,
}

struct PublishedScene {
    next_sequence: SequenceNumber,
    subscribers: BTreeSet<ParticipantId>,
}

pub struct ConnectionManager {
    local: Arc<ParticipantIdentifier>,
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<TaskScheduler>,
    registry: Arc<ParticipantRegistry>,
    daemon: Option<Arc<ParticipantIdentifier>>,
    daemon_retry_at: Instant,
    events: Sender<ManagerEvent>,
    inbound: Sender<Inbound>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    snapshot: Arc<RwLock<Vec<ConnectionInfo>>>,
    connections: HashMap<ParticipantId, Connection>,
    /// Peers learned through discovery or `add_peer`
    visible: HashSet<ParticipantId>,
    /// Peers added explicitly; always dialed regardless of id order
    explicit: HashSet<ParticipantId>,
    published: BTreeMap<SceneId, PublishedScene>,
    links: LinkTable,
    /// Disconnects still queued on the pool, per peer; dials wait for them
    closing: HashMap<ParticipantId, usize>,
    next_generation: u64,
    dirty: bool,
}

pub fn housekeeping_period(keep_alive_interval: Duration) -> Duration {
    (keep_alive_interval / 2).clamp(Duration::from_millis(5), Duration::from_millis(100))
}

impl ConnectionManager {
    pub fn new(setup: ManagerSetup) -> Self {
        ConnectionManager {
            local: setup.local,
            config: setup.config,
            transport: setup.transport,
            scheduler: setup.scheduler,
            registry: setup.registry,
            daemon: setup.daemon,
            daemon_retry_at: Instant::now(),
            events: setup.events,
            inbound: setup.inbound,
            observers: setup.observers,
            snapshot: setup.snapshot,
            connections: HashMap::new(),
            visible: HashSet::new(),
            explicit: HashSet::new(),
            published: BTreeMap::new(),
            links: setup.links,
            closing: HashMap::new(),
            next_generation: 0,
            dirty: false,
        }
    }

    /// Process events until [`Command::Shutdown`]
    pub fn run(mut self, events: Receiver<ManagerEvent>) {
        let tick = housekeeping_period(self.config.keep_alive_interval);
        self.start_daemon_link(Instant::now());
        let mut next_housekeeping = Instant::now() + tick;

        loop {
            let now = Instant::now();
            if now >= next_housekeeping {
                self.housekeeping(now);
                next_housekeeping = now + tick;
            }

            match events.recv_timeout(next_housekeeping.saturating_duration_since(Instant::now())) {
                Ok(ManagerEvent::Command(Command::Shutdown)) => {
                    self.say_goodbye(Instant::now());
                    break;
                }
                Ok(event) => {
                    let now = Instant::now();
                    self.handle(event, now);
                    if self.dirty {
                        self.publish_snapshot(now);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.snapshot.write().clear();
        debug!(participant = %self.local.id, "connection manager stopped");
    }

    fn handle(&mut self, event: ManagerEvent, now: Instant) {
        match event {
            ManagerEvent::Received { peer, payload } => match Message::decode(&payload) {
                Ok(message) if peer.is_daemon() => self.on_daemon_message(message, now),
                Ok(message) => self.on_peer_message(peer, message, now),
                Err(err) => debug!(peer = %peer, error = %err, "dropping undecodable message"),
            },
            ManagerEvent::LinkUp { peer, generation } => self.on_link_up(peer, generation, now),
            ManagerEvent::LinkFailed {
                peer,
                generation,
                reason,
            } => self.on_link_failed(peer, generation, &reason, now),
            ManagerEvent::SendFailed {
                peer,
                generation,
                reason,
            } => {
                if self.is_current(peer, generation) {
                    self.teardown(peer, &format!("send failed: {}", reason), now);
                }
            }
            ManagerEvent::LinkLost { peer, generation } => match generation {
                Some(generation) if self.is_current(peer, generation) => {
                    self.teardown(peer, "link lost", now)
                }
                _ => trace!(peer = %peer, ?generation, "link loss of an earlier connection ignored"),
            },
            ManagerEvent::LinkClosed(peer) => self.on_link_closed(peer, now),
            ManagerEvent::Command(command) => self.on_command(command, now),
        }
    }

    fn is_current(&self, peer: ParticipantId, generation: u64) -> bool {
        self.connections
            .get(&peer)
            .map_or(false, |c| c.generation == generation)
    }

    fn should_dial(&self, peer: ParticipantId) -> bool {
        peer.is_daemon() || self.explicit.contains(&peer) || self.local.id < peer
    }

    fn hello(&self) -> Message {
        Message::Hello {
            identifier: (*self.local).clone(),
            protocol_version: self.config.protocol_version,
        }
    }

    fn announce(&self) -> Message {
        Message::Announce {
            identifier: (*self.local).clone(),
            protocol_version: self.config.protocol_version,
        }
    }

    fn deliver(&self, item: Inbound) {
        let _ = self.inbound.send(item);
    }

    fn open_connection(&mut self, remote: Arc<ParticipantIdentifier>, now: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let outbox = PeerOutbox::new(
            remote.id,
            self.transport.clone(),
            self.scheduler.clone(),
            self.config.max_queued_sends,
            Arc::new(move |peer: ParticipantId, err: SceneCastError| {
                let _ = events.send(ManagerEvent::SendFailed {
                    peer,
                    generation,
                    reason: err.to_string(),
                });
            }),
        );
        trace!(peer = %remote, generation, "connection record created");
        self.connections
            .insert(remote.id, Connection::new(remote, outbox, generation, now));
        self.dirty = true;
    }

    fn dial(&mut self, peer: ParticipantId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        if conn.dialing || conn.link_up || conn.next_dial > now || self.closing.contains_key(&peer) {
            return;
        }
        conn.dialing = true;
        let generation = conn.generation;
        let transport = self.transport.clone();
        let events = self.events.clone();
        let submitted = self.scheduler.submit_fn(move || {
            let event = match transport.connect(peer) {
                Ok(()) => ManagerEvent::LinkUp { peer, generation },
                Err(err) => ManagerEvent::LinkFailed {
                    peer,
                    generation,
                    reason: err.to_string(),
                },
            };
            let _ = events.send(event);
            Ok(())
        });
        if submitted.is_err() {
            conn.dialing = false;
        }
    }

    fn bind_link(&self, peer: ParticipantId, generation: u64) {
        self.links.write().insert(peer, generation);
    }

    fn unbind_link(&self, peer: ParticipantId, generation: u64) {
        let mut links = self.links.write();
        if links.get(&peer) == Some(&generation) {
            links.remove(&peer);
        }
    }

    /// Close the transport link on the pool; dials to `peer` wait until it ran
    fn disconnect_link(&mut self, peer: ParticipantId) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let submitted = self.scheduler.submit_fn(move || {
            transport.disconnect(peer);
            let _ = events.send(ManagerEvent::LinkClosed(peer));
            Ok(())
        });
        match submitted {
            Ok(()) => *self.closing.entry(peer).or_insert(0) += 1,
            Err(_) => self.transport.disconnect(peer),
        }
    }

    fn on_link_closed(&mut self, peer: ParticipantId, now: Instant) {
        if let Some(count) = self.closing.get_mut(&peer) {
            *count -= 1;
            if *count == 0 {
                self.closing.remove(&peer);
            }
        }
        if self.closing.contains_key(&peer) {
            return;
        }
        let waiting = self
            .connections
            .get(&peer)
            .map_or(false, |c| !c.link_up && !c.dialing);
        if waiting && self.should_dial(peer) {
            self.dial(peer, now);
        }
    }

    fn send(&mut self, peer: ParticipantId, message: &Message, now: Instant) {
        match message.encode() {
            Ok(payload) => self.send_encoded(peer, payload, now),
            Err(err) => error!(peer = %peer, error = %err, "failed to encode message"),
        }
    }

    fn send_encoded(&mut self, peer: ParticipantId, payload: Bytes, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.outbox.push(payload);
            conn.last_alive_sent = now;
        }
    }

    /// Send to every established participant
    fn broadcast(&mut self, message: &Message, now: Instant) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode broadcast");
                return;
            }
        };
        let peers: Vec<ParticipantId> = self
            .connections
            .values()
            .filter(|c| c.is_established() && !c.peer().is_daemon())
            .map(|c| c.peer())
            .collect();
        for peer in peers {
            self.send_encoded(peer, payload.clone(), now);
        }
    }

    fn start_daemon_link(&mut self, now: Instant) {
        let Some(daemon) = self.daemon.clone() else {
            return;
        };
        self.open_connection(daemon, now);
        if let Some(conn) = self.connections.get_mut(&ParticipantId::DAEMON) {
            conn.link_up = true;
            conn.hello_sent = true;
            let generation = conn.generation;
            self.bind_link(ParticipantId::DAEMON, generation);
        }
        let announce = self.announce();
        self.send(ParticipantId::DAEMON, &announce, now);
    }

    fn on_link_up(&mut self, peer: ParticipantId, generation: u64, now: Instant) {
        if !self.is_current(peer, generation) {
            return;
        }
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        conn.dialing = false;
        conn.link_up = true;
        self.links.write().insert(peer, generation);
        if conn.hello_sent {
            return;
        }
        conn.hello_sent = true;
        let greeting = if peer.is_daemon() {
            self.announce()
        } else {
            self.hello()
        };
        trace!(peer = %peer, "link up, greeting");
        self.send(peer, &greeting, now);
    }

    fn on_link_failed(&mut self, peer: ParticipantId, generation: u64, reason: &str, now: Instant) {
        if !self.is_current(peer, generation) {
            return;
        }
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.dialing = false;
            conn.next_dial = now + if peer.is_daemon() { DAEMON_RETRY } else { DIAL_RETRY };
            debug!(peer = %peer, reason, "dial failed, will retry");
        }
    }

    fn learn_peer(&mut self, identifier: ParticipantIdentifier, explicit: bool, now: Instant) {
        let peer = identifier.id;
        if peer == self.local.id || peer.is_daemon() {
            return;
        }
        let remote = self.registry.register(identifier);
        if explicit {
            self.explicit.insert(peer);
        }
        if self.visible.insert(peer) {
            debug!(participant = %self.local.id, peer = %remote, "participant visible");
        }
        if !self.connections.contains_key(&peer) {
            self.open_connection(remote, now);
            if self.should_dial(peer) {
                self.dial(peer, now);
            }
        }
    }

    /// A peer left discovery; established connections stay under keep-alive supervision
    fn forget_peer(&mut self, peer: ParticipantId, now: Instant) {
        self.visible.remove(&peer);
        self.explicit.remove(&peer);
        let pending = self
            .connections
            .get(&peer)
            .map_or(false, |c| !c.is_established());
        if pending {
            self.teardown(peer, "left discovery", now);
        }
    }

    fn on_daemon_message(&mut self, message: Message, now: Instant) {
        let Some(conn) = self.connections.get_mut(&ParticipantId::DAEMON) else {
            trace!("message from unknown discovery daemon link dropped");
            return;
        };
        conn.last_alive_received = now;

        match message {
            Message::PeerList(peers) => {
                if conn.transition(ConnectionState::Established) {
                    self.dirty = true;
                    info!(
                        participant = %self.local.id,
                        peers = peers.len(),
                        "announced to discovery daemon"
                    );
                }
                for identifier in peers {
                    self.learn_peer(identifier, false, now);
                }
            }
            Message::PeerJoined(identifier) => self.learn_peer(identifier, false, now),
            Message::PeerLeft(peer) => self.forget_peer(peer, now),
            Message::Alive => {}
            Message::Goodbye => self.teardown(ParticipantId::DAEMON, "daemon goodbye", now),
            other => debug!(kind = ?other.message_type(), "unexpected message from discovery daemon"),
        }
    }

    fn on_peer_message(&mut self, peer: ParticipantId, message: Message, now: Instant) {
        let message = match message {
            Message::Hello {
                identifier,
                protocol_version,
            } => return self.on_hello(peer, identifier, protocol_version, now),
            Message::Goodbye => {
                self.visible.remove(&peer);
                self.explicit.remove(&peer);
                return self.teardown(peer, "goodbye", now);
            }
            other => other,
        };

        let Some(conn) = self.connections.get_mut(&peer) else {
            trace!(peer = %peer, "message from unknown participant dropped");
            return;
        };
        conn.last_alive_received = now;
        if !conn.is_established() {
            if message != Message::Alive {
                debug!(peer = %peer, kind = ?message.message_type(), "message before handshake dropped");
            }
            return;
        }

        match message {
            Message::Alive => {}
            Message::PublishScene(scene) => self.deliver(Inbound::Published {
                scene,
                provider: peer,
            }),
            Message::UnpublishScene(scene) => self.deliver(Inbound::Unpublished {
                scene,
                provider: peer,
            }),
            Message::SubscribeScene(scene) => self.on_subscribe(peer, scene, now),
            Message::UnsubscribeScene(scene) => {
                if let Some(published) = self.published.get_mut(&scene) {
                    published.subscribers.remove(&peer);
                }
            }
            Message::SceneNotAvailable(scene) => self.deliver(Inbound::Unavailable {
                scene,
                provider: peer,
            }),
            Message::SubscriptionAccepted {
                scene,
                next_sequence,
            } => self.deliver(Inbound::Accepted {
                scene,
                provider: peer,
                next_sequence,
            }),
            Message::Flush(flush) => self.deliver(Inbound::Flush {
                provider: peer,
                flush,
            }),
            other => debug!(peer = %peer, kind = ?other.message_type(), "unexpected message dropped"),
        }
    }

    fn on_hello(
        &mut self,
        peer: ParticipantId,
        identifier: ParticipantIdentifier,
        protocol_version: u32,
        now: Instant,
    ) {
        if protocol_version != self.config.protocol_version {
            warn!(
                participant = %self.local.id,
                peer = %peer,
                expected = self.config.protocol_version,
                actual = protocol_version,
                "protocol version mismatch, disconnecting"
            );
            if let Some(conn) = self.connections.remove(&peer) {
                conn.outbox.close();
                self.unbind_link(peer, conn.generation);
                self.dirty = true;
            }
            self.disconnect_link(peer);
            return;
        }
        if identifier.id != peer {
            warn!(peer = %peer, claimed = %identifier.id, "hello identity does not match link, ignored");
            return;
        }

        let remote = self.registry.register(identifier);
        if !self.connections.contains_key(&peer) {
            self.open_connection(remote.clone(), now);
        }
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        conn.last_alive_received = now;
        conn.link_up = true;
        conn.dialing = false;
        self.links.write().insert(peer, conn.generation);
        if !conn.transition(ConnectionState::Established) {
            debug!(peer = %peer, state = %conn.state(), "duplicate hello ignored");
            return;
        }
        let reply = !conn.hello_sent;
        conn.hello_sent = true;
        self.dirty = true;

        if reply {
            let hello = self.hello();
            self.send(peer, &hello, now);
        }
        info!(participant = %self.local.id, peer = %remote, "connection established");
        for observer in &self.observers {
            observer.participant_connected(&remote);
        }
        self.deliver(Inbound::Connected(peer));

        let scenes: Vec<SceneId> = self.published.keys().copied().collect();
        for scene in scenes {
            self.send(peer, &Message::PublishScene(scene), now);
        }
    }

    fn on_subscribe(&mut self, peer: ParticipantId, scene: SceneId, now: Instant) {
        let reply = match self.published.get_mut(&scene) {
            Some(published) => {
                published.subscribers.insert(peer);
                debug!(scene = %scene, subscriber = %peer, next = %published.next_sequence, "subscription accepted");
                Message::SubscriptionAccepted {
                    scene,
                    next_sequence: published.next_sequence,
                }
            }
            None => Message::SceneNotAvailable(scene),
        };
        self.send(peer, &reply, now);
    }

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Publish {
                scene,
                next_sequence,
            } => {
                self.published.entry(scene).or_insert(PublishedScene {
                    next_sequence,
                    subscribers: BTreeSet::new(),
                });
                info!(participant = %self.local.id, scene = %scene, "scene published");
                self.broadcast(&Message::PublishScene(scene), now);
            }
            Command::Unpublish(scene) => {
                if self.published.remove(&scene).is_some() {
                    info!(participant = %self.local.id, scene = %scene, "scene unpublished");
                    self.broadcast(&Message::UnpublishScene(scene), now);
                }
            }
            Command::Flush {
                scene,
                sequence,
                payload,
            } => self.forward_flush(scene, sequence, payload, now),
            Command::Subscribe { scene, provider } => {
                let established = self
                    .connections
                    .get(&provider)
                    .map_or(false, |c| c.is_established());
                if established {
                    self.send(provider, &Message::SubscribeScene(scene), now);
                } else {
                    self.deliver(Inbound::Unavailable { scene, provider });
                }
            }
            Command::Unsubscribe { scene, provider } => {
                self.send(provider, &Message::UnsubscribeScene(scene), now);
            }
            Command::AddPeer(identifier) => self.learn_peer(identifier, true, now),
            Command::Disconnect(peer) => {
                self.visible.remove(&peer);
                self.explicit.remove(&peer);
                self.teardown(peer, "disconnect requested", now);
            }
            Command::ResetPeer { peer, reason } => self.teardown(peer, &reason, now),
            Command::Shutdown => {}
        }
    }

    fn forward_flush(&mut self, scene: SceneId, sequence: SequenceNumber, payload: Bytes, now: Instant) {
        let Some(published) = self.published.get_mut(&scene) else {
            debug!(scene = %scene, "flush for unpublished scene dropped");
            return;
        };
        published.next_sequence = sequence.next();
        if published.subscribers.is_empty() {
            return;
        }
        let subscribers: Vec<ParticipantId> = published.subscribers.iter().copied().collect();
        for peer in subscribers {
            self.send_encoded(peer, payload.clone(), now);
        }
    }

    /// Remove the record for `peer` and emit its lost transition
    ///
    /// The record is removed first, so repeated triggers for the same
    /// connection are no-ops.
    fn teardown(&mut self, peer: ParticipantId, reason: &str, now: Instant) {
        let Some(mut conn) = self.connections.remove(&peer) else {
            return;
        };
        let was_established = conn.is_established();
        conn.transition(ConnectionState::Closing);
        conn.outbox.close();
        self.unbind_link(peer, conn.generation);
        self.disconnect_link(peer);
        for published in self.published.values_mut() {
            published.subscribers.remove(&peer);
        }
        self.dirty = true;

        if peer.is_daemon() {
            self.daemon_retry_at = now + DAEMON_RETRY;
            if was_established {
                warn!(participant = %self.local.id, reason, "lost discovery daemon, keeping direct connections");
            } else {
                debug!(participant = %self.local.id, reason, "discovery daemon not reached");
            }
        } else if was_established {
            info!(participant = %self.local.id, peer = %conn.remote, reason, "participant lost");
            for observer in &self.observers {
                observer.participant_lost(peer);
            }
            self.deliver(Inbound::Lost(peer));
        } else {
            debug!(peer = %peer, reason, "connection attempt abandoned");
        }
        conn.transition(ConnectionState::Closed);
    }

    fn housekeeping(&mut self, now: Instant) {
        let interval = self.config.keep_alive_interval;
        let timeout = self.config.keep_alive_timeout;
        let mut expired = Vec::new();
        let mut stale = Vec::new();
        let mut alive = Vec::new();
        let mut dial = Vec::new();

        for (peer, conn) in &self.connections {
            match conn.state() {
                ConnectionState::Established => {
                    if conn.keep_alive_expired(now, timeout) {
                        expired.push(*peer);
                    } else if conn.keep_alive_due(now, interval) {
                        alive.push(*peer);
                    }
                }
                ConnectionState::Connecting => {
                    if now.saturating_duration_since(conn.created) > timeout {
                        stale.push(*peer);
                    } else if !conn.link_up
                        && !conn.dialing
                        && conn.next_dial <= now
                        && self.should_dial(*peer)
                    {
                        dial.push(*peer);
                    }
                }
                ConnectionState::Closing | ConnectionState::Closed => {}
            }
        }

        for peer in expired {
            warn!(participant = %self.local.id, peer = %peer, timeout = ?timeout, "keep-alive timeout");
            self.teardown(peer, "keep-alive timeout", now);
        }
        for peer in stale {
            self.teardown(peer, "not established in time", now);
        }
        for peer in alive {
            self.send(peer, &Message::Alive, now);
        }
        for peer in dial {
            self.dial(peer, now);
        }

        let missing: Vec<ParticipantId> = self
            .visible
            .iter()
            .filter(|p| !self.connections.contains_key(p))
            .copied()
            .collect();
        for peer in missing {
            if let Some(remote) = self.registry.identifier(peer) {
                self.open_connection(remote, now);
                if self.should_dial(peer) {
                    self.dial(peer, now);
                }
            }
        }

        if let Some(daemon) = self.daemon.clone() {
            if !self.connections.contains_key(&daemon.id) && now >= self.daemon_retry_at {
                self.open_connection(daemon, now);
                self.dial(ParticipantId::DAEMON, now);
            }
        }

        self.publish_snapshot(now);
    }

    fn say_goodbye(&mut self, now: Instant) {
        let peers: Vec<ParticipantId> = self
            .connections
            .values()
            .filter(|c| c.is_established() || (c.peer().is_daemon() && c.link_up))
            .map(|c| c.peer())
            .collect();
        for peer in peers {
            self.send(peer, &Message::Goodbye, now);
        }
        debug!(participant = %self.local.id, "goodbye sent");
    }

    fn publish_snapshot(&mut self, now: Instant) {
        let mut infos: Vec<ConnectionInfo> = self.connections.values().map(|c| c.info(now)).collect();
        infos.sort_by_key(|info| info.peer);
        *self.snapshot.write() = infos;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::DEFAULT_MAX_QUEUED_SENDS;
    use scenecast_core::{ParticipantAddress, PROTOCOL_VERSION};
    use scenecast_sched::SchedulerConfig;
    use scenecast_transport::{LoopbackHub, LoopbackTransport};
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};

    const WAIT: Duration = Duration::from_secs(2);

    struct RawPeer {
        transport: LoopbackTransport,
        messages: Receiver<Message>,
        disconnects: Receiver<ParticipantId>,
    }

    struct RawHandler {
        messages: Sender<Message>,
        disconnects: Sender<ParticipantId>,
    }

    impl TransportHandler for RawHandler {
        fn on_receive(&self, _peer: ParticipantId, payload: Bytes) {
            if let Ok(message) = Message::decode(&payload) {
                let _ = self.messages.send(message);
            }
        }

        fn on_disconnected(&self, peer: ParticipantId) {
            let _ = self.disconnects.send(peer);
        }
    }

    impl RawPeer {
        fn new(hub: &LoopbackHub, id: u64) -> Self {
            let transport = LoopbackTransport::new(hub, ParticipantId::new(id), "raw").unwrap();
            let (msg_tx, messages) = mpsc::channel();
            let (dc_tx, disconnects) = mpsc::channel();
            transport
                .start(Arc::new(RawHandler {
                    messages: msg_tx,
                    disconnects: dc_tx,
                }))
                .unwrap();
            RawPeer {
                transport,
                messages,
                disconnects,
            }
        }

        fn id(&self) -> ParticipantId {
            self.transport.local_identifier().id
        }

        fn send(&self, to: ParticipantId, message: Message) {
            self.transport.connect(to).unwrap();
            self.transport.send(to, &message.encode().unwrap()).unwrap();
        }

        fn hello(&self, to: ParticipantId, version: u32) {
            self.send(
                to,
                Message::Hello {
                    identifier: self.transport.local_identifier().clone(),
                    protocol_version: version,
                },
            );
        }

        /// Next message that is not a keep-alive
        fn next(&self) -> Option<Message> {
            let deadline = Instant::now() + WAIT;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                match self.messages.recv_timeout(left) {
                    Ok(Message::Alive) => continue,
                    Ok(message) => return Some(message),
                    Err(_) => return None,
                }
            }
        }
    }

    struct Rig {
        id: ParticipantId,
        commands: Sender<ManagerEvent>,
        inbound: Receiver<Inbound>,
        links: LinkTable,
        thread: Option<JoinHandle<()>>,
        _transport: Arc<dyn Transport>,
    }

    impl Rig {
        fn start(hub: &LoopbackHub, id: u64) -> Self {
            Self::with_timeout(hub, id, Duration::from_secs(5))
        }

        fn with_timeout(hub: &LoopbackHub, id: u64, keep_alive_timeout: Duration) -> Self {
            let transport: Arc<dyn Transport> =
                Arc::new(LoopbackTransport::new(hub, ParticipantId::new(id), "managed").unwrap());
            let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig::default(), None));
            scheduler.start().unwrap();
            let (events_tx, events_rx) = mpsc::channel();
            let (inbound_tx, inbound) = mpsc::channel();
            let handler = Arc::new(ManagerHandler::new(events_tx.clone()));
            let links = handler.links();
            transport.start(handler).unwrap();
            let manager = ConnectionManager::new(ManagerSetup {
                local: Arc::new(transport.local_identifier().clone()),
                config: ManagerConfig {
                    keep_alive_interval: Duration::from_millis(20),
                    keep_alive_timeout,
                    protocol_version: PROTOCOL_VERSION,
                    max_queued_sends: DEFAULT_MAX_QUEUED_SENDS,
                },
                transport: transport.clone(),
                scheduler,
                registry: Arc::new(ParticipantRegistry::new()),
                daemon: None,
                events: events_tx.clone(),
                inbound: inbound_tx,
                observers: Vec::new(),
                snapshot: Arc::new(RwLock::new(Vec::new())),
                links: links.clone(),
            });
            let thread = thread::spawn(move || manager.run(events_rx));
            Rig {
                id: ParticipantId::new(id),
                commands: events_tx,
                inbound,
                links,
                thread: Some(thread),
                _transport: transport,
            }
        }

        fn command(&self, command: Command) {
            self.commands.send(ManagerEvent::Command(command)).unwrap();
        }

        fn flush(&self, flush: Flush) {
            self.command(Command::Flush {
                scene: flush.scene,
                sequence: flush.sequence,
                payload: Message::Flush(flush).encode().unwrap(),
            });
        }

        fn generation(&self, peer: ParticipantId) -> Option<u64> {
            self.links.read().get(&peer).copied()
        }

        fn next_inbound(&self) -> Option<Inbound> {
            self.inbound.recv_timeout(WAIT).ok()
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = self.commands.send(ManagerEvent::Command(Command::Shutdown));
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[test]
    fn test_housekeeping_period_is_bounded() {
        assert_eq!(housekeeping_period(Duration::from_millis(300)), Duration::from_millis(100));
        assert_eq!(housekeeping_period(Duration::from_millis(40)), Duration::from_millis(20));
        assert_eq!(housekeeping_period(Duration::from_millis(2)), Duration::from_millis(5));
    }

    #[test]
    fn test_hello_handshake_connects_once() {
        let hub = LoopbackHub::new();
        let rig = Rig::start(&hub, 10);
        let raw = RawPeer::new(&hub, 20);

        raw.hello(rig.id, PROTOCOL_VERSION);
        match raw.next() {
            Some(Message::Hello { identifier, .. }) => assert_eq!(identifier.id, rig.id),
            other => panic!("expected hello, got {:?}", other),
        }
        assert_eq!(rig.next_inbound(), Some(Inbound::Connected(raw.id())));

        raw.hello(rig.id, PROTOCOL_VERSION);
        raw.send(rig.id, Message::Goodbye);
        assert_eq!(rig.next_inbound(), Some(Inbound::Lost(raw.id())));
        assert!(rig.inbound.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_version_mismatch_disconnects_without_event() {
        let hub = LoopbackHub::new();
        let rig = Rig::start(&hub, 10);
        let raw = RawPeer::new(&hub, 20);

        raw.hello(rig.id, PROTOCOL_VERSION + 1);
        assert_eq!(raw.disconnects.recv_timeout(WAIT), Ok(rig.id));
        assert!(rig.inbound.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_scene_messages_before_handshake_are_dropped() {
        let hub = LoopbackHub::new();
        let rig = Rig::start(&hub, 10);
        let raw = RawPeer::new(&hub, 20);

        raw.send(rig.id, Message::PublishScene(SceneId::new(1)));
        assert!(rig.inbound.recv_timeout(Duration::from_millis(100)).is_err());

        raw.hello(rig.id, PROTOCOL_VERSION);
        assert_eq!(rig.next_inbound(), Some(Inbound::Connected(raw.id())));
        raw.send(rig.id, Message::PublishScene(SceneId::new(1)));
        assert_eq!(
            rig.next_inbound(),
            Some(Inbound::Published {
                scene: SceneId::new(1),
                provider: raw.id()
            })
        );
    }

    #[test]
    fn test_provider_answers_subscriptions_and_forwards_flushes() {
        let hub = LoopbackHub::new();
        let rig = Rig::start(&hub, 10);
        let raw = RawPeer::new(&hub, 20);
        let scene = SceneId::new(3);

        raw.hello(rig.id, PROTOCOL_VERSION);
        assert!(matches!(raw.next(), Some(Message::Hello { .. })));

        raw.send(rig.id, Message::SubscribeScene(scene));
        assert_eq!(raw.next(), Some(Message::SceneNotAvailable(scene)));

        rig.command(Command::Publish {
            scene,
            next_sequence: SequenceNumber::new(4),
        });
        assert_eq!(raw.next(), Some(Message::PublishScene(scene)));

        raw.send(rig.id, Message::SubscribeScene(scene));
        assert_eq!(
            raw.next(),
            Some(Message::SubscriptionAccepted {
                scene,
                next_sequence: SequenceNumber::new(4)
            })
        );

        let flush = Flush::new(scene, SequenceNumber::new(4), vec![1u8, 2, 3]);
        rig.flush(flush.clone());
        assert_eq!(raw.next(), Some(Message::Flush(flush)));

        raw.send(rig.id, Message::UnsubscribeScene(scene));
        rig.flush(Flush::new(scene, SequenceNumber::new(5), vec![9u8]));
        rig.command(Command::Unpublish(scene));
        assert_eq!(raw.next(), Some(Message::UnpublishScene(scene)));
    }

    #[test]
    fn test_stale_link_loss_after_reconnect_is_ignored() {
        let hub = LoopbackHub::new();
        let rig = Rig::start(&hub, 10);
        let raw = RawPeer::new(&hub, 20);

        raw.hello(rig.id, PROTOCOL_VERSION);
        assert_eq!(rig.next_inbound(), Some(Inbound::Connected(raw.id())));
        let first = rig.generation(raw.id());
        assert!(first.is_some());

        raw.send(rig.id, Message::Goodbye);
        assert_eq!(rig.next_inbound(), Some(Inbound::Lost(raw.id())));
        assert_eq!(raw.disconnects.recv_timeout(WAIT), Ok(rig.id));

        raw.hello(rig.id, PROTOCOL_VERSION);
        assert_eq!(rig.next_inbound(), Some(Inbound::Connected(raw.id())));
        let second = rig.generation(raw.id());
        assert!(second.is_some());
        assert_ne!(first, second);

        // the first connection's link breaking late must not touch the second
        rig.commands
            .send(ManagerEvent::LinkLost {
                peer: raw.id(),
                generation: first,
            })
            .unwrap();
        raw.send(rig.id, Message::PublishScene(SceneId::new(1)));
        assert_eq!(
            rig.next_inbound(),
            Some(Inbound::Published {
                scene: SceneId::new(1),
                provider: raw.id()
            })
        );

        rig.commands
            .send(ManagerEvent::LinkLost {
                peer: raw.id(),
                generation: second,
            })
            .unwrap();
        assert_eq!(rig.next_inbound(), Some(Inbound::Lost(raw.id())));
        assert_eq!(rig.generation(raw.id()), None);
    }

    #[test]
    fn test_silent_peer_times_out_once() {
        let hub = LoopbackHub::new();
        let rig = Rig::with_timeout(&hub, 10, Duration::from_millis(300));
        let raw = RawPeer::new(&hub, 20);

        raw.hello(rig.id, PROTOCOL_VERSION);
        assert_eq!(rig.next_inbound(), Some(Inbound::Connected(raw.id())));
        hub.partition(rig.id, raw.id());

        assert_eq!(rig.next_inbound(), Some(Inbound::Lost(raw.id())));
        assert!(rig.inbound.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_explicit_peer_is_dialed_and_greeted() {
        let hub = LoopbackHub::new();
        let rig = Rig::start(&hub, 50);
        let raw = RawPeer::new(&hub, 20);

        rig.command(Command::AddPeer(ParticipantIdentifier::new(
            raw.id(),
            "raw",
            ParticipantAddress::Local,
        )));
        match raw.next() {
            Some(Message::Hello { identifier, .. }) => assert_eq!(identifier.id, rig.id),
            other => panic!("expected hello, got {:?}", other),
        }
        raw.hello(rig.id, PROTOCOL_VERSION);
        assert_eq!(rig.next_inbound(), Some(Inbound::Connected(raw.id())));
    }
}

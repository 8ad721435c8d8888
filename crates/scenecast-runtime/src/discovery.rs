//! Discovery daemon
//!
//! Runs at a well-known address and only exchanges participant identities:
//! a newcomer's `Announce` is answered with the current member list and
//! broadcast to everyone else as `PeerJoined`; a departure (goodbye, lost
//! link or keep-alive timeout) is broadcast as `PeerLeft`. Scene content
//! never passes through the daemon.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use scenecast_core::{
    ParticipantAddress, ParticipantId, ParticipantIdentifier, SceneCastError, SceneCastResult,
};
use scenecast_sched::{SchedulerConfig, TaskScheduler};
use scenecast_transport::{LoopbackHub, LoopbackTransport, ParticipantRegistry, TcpTransport, Transport};
use scenecast_wire::Message;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::manager::{housekeeping_period, Command, LinkTable, ManagerEvent, ManagerHandler};
use crate::outbox::PeerOutbox;

const DAEMON_NAME: &str = "discovery-daemon";

struct Member {
    identifier: ParticipantIdentifier,
    last_alive_sent: Instant,
    last_alive_received: Instant,
    outbox: Arc<PeerOutbox>,
    generation: u64,
}

struct DaemonLoop {
    keep_alive_interval: Duration,
    keep_alive_timeout: Duration,
    protocol_version: u32,
    max_queued_sends: usize,
    transport: Arc<dyn Transport>,
    scheduler: Arc<TaskScheduler>,
    events: Sender<ManagerEvent>,
    links: LinkTable,
    members: HashMap<ParticipantId, Member>,
    roster: Arc<RwLock<Vec<ParticipantIdentifier>>>,
    next_generation: u64,
}

impl DaemonLoop {
    fn run(mut self, events: Receiver<ManagerEvent>) {
        let tick = housekeeping_period(self.keep_alive_interval);
        let mut next_housekeeping = Instant::now() + tick;

        loop {
            let now = Instant::now();
            if now >= next_housekeeping {
                self.housekeeping(now);
                next_housekeeping = now + tick;
            }

            match events.recv_timeout(next_housekeeping.saturating_duration_since(Instant::now())) {
                Ok(ManagerEvent::Command(Command::Shutdown)) => {
                    let members: Vec<ParticipantId> = self.members.keys().copied().collect();
                    for peer in members {
                        self.send(peer, &Message::Goodbye, Instant::now());
                    }
                    break;
                }
                Ok(ManagerEvent::Received { peer, payload }) => self.on_receive(peer, payload),
                Ok(ManagerEvent::LinkLost { peer, generation }) => {
                    if generation.is_some() && self.members.get(&peer).map(|m| m.generation) == generation {
                        self.remove_member(peer, "link lost");
                    } else {
                        trace!(peer = %peer, ?generation, "link loss of an earlier member ignored");
                    }
                }
                Ok(ManagerEvent::SendFailed {
                    peer, generation, ..
                }) => {
                    if self.members.get(&peer).map_or(false, |m| m.generation == generation) {
                        self.remove_member(peer, "send failed");
                    }
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.roster.write().clear();
        debug!("discovery daemon loop stopped");
    }

    fn on_receive(&mut self, peer: ParticipantId, payload: Bytes) {
        let now = Instant::now();
        let message = match Message::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(peer = %peer, error = %err, "dropping undecodable message");
                return;
            }
        };
        if let Some(member) = self.members.get_mut(&peer) {
            member.last_alive_received = now;
        }

        match message {
            Message::Announce {
                identifier,
                protocol_version,
            } => self.on_announce(peer, identifier, protocol_version, now),
            Message::Alive => {}
            Message::Goodbye => self.remove_member(peer, "goodbye"),
            other => debug!(peer = %peer, kind = ?other.message_type(), "daemon ignores message"),
        }
    }

    fn on_announce(
        &mut self,
        peer: ParticipantId,
        identifier: ParticipantIdentifier,
        protocol_version: u32,
        now: Instant,
    ) {
        if protocol_version != self.protocol_version {
            warn!(
                peer = %peer,
                expected = self.protocol_version,
                actual = protocol_version,
                "announce with mismatching protocol version rejected"
            );
            self.disconnect_link(peer);
            return;
        }
        if identifier.id != peer {
            warn!(peer = %peer, claimed = %identifier.id, "announce identity does not match link, ignored");
            return;
        }

        let others: Vec<ParticipantIdentifier> = self
            .members
            .values()
            .filter(|m| m.identifier.id != peer)
            .map(|m| m.identifier.clone())
            .collect();

        let rejoin = match self.members.get_mut(&peer) {
            Some(member) => {
                member.identifier = identifier.clone();
                true
            }
            None => {
                self.next_generation += 1;
                let generation = self.next_generation;
                let events = self.events.clone();
                let outbox = PeerOutbox::new(
                    peer,
                    self.transport.clone(),
                    self.scheduler.clone(),
                    self.max_queued_sends,
                    Arc::new(move |peer: ParticipantId, err: SceneCastError| {
                        let _ = events.send(ManagerEvent::SendFailed {
                            peer,
                            generation,
                            reason: err.to_string(),
                        });
                    }),
                );
                self.links.write().insert(peer, generation);
                self.members.insert(
                    peer,
                    Member {
                        identifier: identifier.clone(),
                        last_alive_sent: now,
                        last_alive_received: now,
                        outbox,
                        generation,
                    },
                );
                false
            }
        };

        self.send(peer, &Message::PeerList(others.clone()), now);
        if !rejoin {
            info!(participant = %identifier, members = self.members.len(), "participant announced");
            let joined = Message::PeerJoined(identifier);
            for other in others {
                self.send(other.id, &joined, now);
            }
        }
        self.publish_roster();
    }

    fn remove_member(&mut self, peer: ParticipantId, reason: &str) {
        let Some(member) = self.members.remove(&peer) else {
            return;
        };
        member.outbox.close();
        {
            let mut links = self.links.write();
            if links.get(&peer) == Some(&member.generation) {
                links.remove(&peer);
            }
        }
        self.disconnect_link(peer);
        info!(participant = %member.identifier, reason, "participant left");

        let now = Instant::now();
        let others: Vec<ParticipantId> = self.members.keys().copied().collect();
        for other in others {
            self.send(other, &Message::PeerLeft(peer), now);
        }
        self.publish_roster();
    }

    fn housekeeping(&mut self, now: Instant) {
        let mut expired = Vec::new();
        let mut alive = Vec::new();
        for (peer, member) in &self.members {
            if now.saturating_duration_since(member.last_alive_received) > self.keep_alive_timeout {
                expired.push(*peer);
            } else if now.saturating_duration_since(member.last_alive_sent) >= self.keep_alive_interval {
                alive.push(*peer);
            }
        }
        for peer in expired {
            warn!(peer = %peer, "participant missed keep-alive");
            self.remove_member(peer, "keep-alive timeout");
        }
        for peer in alive {
            self.send(peer, &Message::Alive, now);
        }
    }

    fn send(&mut self, peer: ParticipantId, message: &Message, now: Instant) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(peer = %peer, error = %err, "failed to encode message");
                return;
            }
        };
        if let Some(member) = self.members.get_mut(&peer) {
            member.outbox.push(payload);
            member.last_alive_sent = now;
        }
    }

    fn disconnect_link(&self, peer: ParticipantId) {
        let transport = self.transport.clone();
        if self
            .scheduler
            .submit_fn(move || {
                transport.disconnect(peer);
                Ok(())
            })
            .is_err()
        {
            self.transport.disconnect(peer);
        }
    }

    fn publish_roster(&self) {
        let mut roster: Vec<ParticipantIdentifier> =
            self.members.values().map(|m| m.identifier.clone()).collect();
        roster.sort_by_key(|identifier| identifier.id);
        *self.roster.write() = roster;
    }
}

/// Rendezvous point that tells participants about each other
pub struct DiscoveryDaemon {
    identifier: ParticipantIdentifier,
    transport: Arc<dyn Transport>,
    scheduler: Arc<TaskScheduler>,
    events: Sender<ManagerEvent>,
    thread: Option<JoinHandle<()>>,
    roster: Arc<RwLock<Vec<ParticipantIdentifier>>>,
}

impl DiscoveryDaemon {
    /// Run the daemon on an already constructed transport
    pub fn start(config: &SessionConfig, transport: Arc<dyn Transport>) -> SceneCastResult<Self> {
        let identifier = transport.local_identifier().clone();
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig {
                name: DAEMON_NAME.into(),
                pool_size: config.worker_pool_size.max(1),
                watchdog_interval: config.watchdog_interval,
            },
            None,
        ));
        scheduler.start()?;

        let (events_tx, events_rx) = mpsc::channel();
        let handler = Arc::new(ManagerHandler::new(events_tx.clone()));
        let links = handler.links();
        transport.start(handler)?;

        let roster = Arc::new(RwLock::new(Vec::new()));
        let daemon_loop = DaemonLoop {
            keep_alive_interval: config.keep_alive_interval,
            keep_alive_timeout: config.keep_alive_timeout,
            protocol_version: config.protocol_version,
            max_queued_sends: config.max_queued_sends,
            transport: transport.clone(),
            scheduler: scheduler.clone(),
            events: events_tx.clone(),
            links,
            members: HashMap::new(),
            roster: roster.clone(),
            next_generation: 0,
        };
        let thread = thread::Builder::new()
            .name(DAEMON_NAME.into())
            .spawn(move || daemon_loop.run(events_rx));
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                transport.shutdown();
                scheduler.shutdown();
                return Err(err.into());
            }
        };

        info!(
            address = %identifier.address,
            keep_alive_interval = ?config.keep_alive_interval,
            keep_alive_timeout = ?config.keep_alive_timeout,
            "discovery daemon started"
        );
        Ok(DiscoveryDaemon {
            identifier,
            transport,
            scheduler,
            events: events_tx,
            thread: Some(thread),
            roster,
        })
    }

    /// Daemon on an in-process hub
    pub fn start_loopback(config: &SessionConfig, hub: &LoopbackHub) -> SceneCastResult<Self> {
        let transport = LoopbackTransport::new(hub, ParticipantId::DAEMON, DAEMON_NAME)?;
        Self::start(config, Arc::new(transport))
    }

    /// Daemon listening on `bind`; port 0 picks an ephemeral port
    pub fn bind_tcp(config: &SessionConfig, bind: SocketAddr) -> SceneCastResult<Self> {
        let transport = TcpTransport::bind(
            ParticipantId::DAEMON,
            DAEMON_NAME,
            bind,
            Arc::new(ParticipantRegistry::new()),
        )?;
        Self::start(config, Arc::new(transport))
    }

    pub fn address(&self) -> ParticipantAddress {
        self.identifier.address
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.identifier.address.socket()
    }

    /// Currently announced participants, ordered by id
    pub fn participants(&self) -> Vec<ParticipantIdentifier> {
        self.roster.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Say goodbye to every member and stop; no-op when already stopped
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.events.send(ManagerEvent::Command(Command::Shutdown));
        let _ = thread.join();
        self.scheduler.drain(Duration::from_secs(1));
        self.transport.shutdown();
        self.scheduler.shutdown();
        info!("discovery daemon stopped");
    }
}

impl Drop for DiscoveryDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

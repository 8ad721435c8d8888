//! TCP transport
//!
//! One listener thread accepts inbound streams; every link gets its own
//! reader thread. Writes happen on the caller's thread under a per-link
//! lock. Each dialed stream starts with a preamble frame carrying a magic
//! value and the dialer's participant id, so the accepting side knows who
//! connected before any session message arrives.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use scenecast_core::{
    ParticipantAddress, ParticipantId, ParticipantIdentifier, SceneCastError, SceneCastResult,
};
use scenecast_wire::{read_frame, write_frame, MAX_MESSAGE_SIZE};
use tracing::{debug, info, warn};

use crate::{ParticipantRegistry, Transport, TransportHandler};

/// Upper bound for establishing an outbound stream
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long an accepted stream may take to send its preamble
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept loop poll period
const ACCEPT_POLL: Duration = Duration::from_millis(20);

const PREAMBLE_MAGIC: u32 = 0x434E_4353;
const PREAMBLE_SIZE: usize = 12;

fn encode_preamble(id: ParticipantId) -> [u8; PREAMBLE_SIZE] {
    let mut buf = [0u8; PREAMBLE_SIZE];
    buf[0..4].copy_from_slice(&PREAMBLE_MAGIC.to_le_bytes());
    buf[4..12].copy_from_slice(&id.to_bytes());
    buf
}

fn decode_preamble(buf: &[u8]) -> SceneCastResult<ParticipantId> {
    if buf.len() != PREAMBLE_SIZE {
        return Err(SceneCastError::BufferTooShort {
            expected: PREAMBLE_SIZE,
            actual: buf.len(),
        });
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0..4]);
    if u32::from_le_bytes(magic) != PREAMBLE_MAGIC {
        return Err(SceneCastError::InvalidWireFormat("bad link preamble".into()));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[4..12]);
    Ok(ParticipantId::from_bytes(id))
}

struct Link {
    id: u64,
    writer: Arc<Mutex<TcpStream>>,
}

struct Shared {
    local: ParticipantId,
    links: Mutex<HashMap<ParticipantId, Link>>,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    running: AtomicBool,
    next_link: AtomicU64,
    /// Every open stream by link id, including read-only duplicates
    streams: Mutex<HashMap<u64, (ParticipantId, TcpStream)>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.read().clone()
    }

    /// Register a stream for `peer` unless one exists; spawns its reader
    fn add_link(self: &Arc<Self>, peer: ParticipantId, stream: TcpStream) -> SceneCastResult<()> {
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(link_id, (peer, closer));
        let registered = {
            let mut links = self.links.lock();
            if links.contains_key(&peer) {
                false
            } else {
                links.insert(
                    peer,
                    Link {
                        id: link_id,
                        writer: Arc::new(Mutex::new(stream)),
                    },
                );
                true
            }
        };
        if !registered {
            debug!(peer = %peer, "second link to peer, reading only");
        }

        let shared = self.clone();
        let handle = thread::Builder::new()
            .name(format!("scenecast-tcp-read-{}", peer))
            .spawn(move || shared.read_loop(peer, link_id, reader))?;

        let mut readers = self.readers.lock();
        readers.retain(|h| !h.is_finished());
        readers.push(handle);
        Ok(())
    }

    fn read_loop(&self, peer: ParticipantId, link_id: u64, mut stream: TcpStream) {
        loop {
            match read_frame(&mut stream) {
                Ok(frame) => {
                    if let Some(handler) = self.handler() {
                        handler.on_receive(peer, Bytes::from(frame));
                    }
                }
                Err(err) => {
                    debug!(peer = %peer, error = %err, "link reader stopped");
                    break;
                }
            }
        }

        self.streams.lock().remove(&link_id);
        let removed = {
            let mut links = self.links.lock();
            match links.get(&peer) {
                Some(link) if link.id == link_id => links.remove(&peer),
                _ => None,
            }
        };
        if let Some(link) = removed {
            let _ = link.writer.lock().shutdown(Shutdown::Both);
            if self.running.load(Ordering::Acquire) {
                if let Some(handler) = self.handler() {
                    handler.on_disconnected(peer);
                }
            }
        }
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = self.accept_stream(stream) {
                        warn!(remote = %addr, error = %err, "rejected inbound link");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn accept_stream(self: &Arc<Self>, mut stream: TcpStream) -> SceneCastResult<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(PREAMBLE_TIMEOUT))?;
        let preamble = read_frame(&mut stream)?;
        let peer = decode_preamble(&preamble)?;
        stream.set_read_timeout(None)?;
        debug!(local = %self.local, peer = %peer, "inbound link");
        self.add_link(peer, stream)
    }
}

/// Network transport over TCP streams
pub struct TcpTransport {
    identifier: ParticipantIdentifier,
    registry: Arc<ParticipantRegistry>,
    listener: Mutex<Option<TcpListener>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Bind the listening socket; port 0 picks an ephemeral port
    ///
    /// The announced address is the bound one. An unspecified bind address
    /// is announced as loopback.
    pub fn bind(
        id: ParticipantId,
        name: impl Into<String>,
        bind: SocketAddr,
        registry: Arc<ParticipantRegistry>,
    ) -> SceneCastResult<Self> {
        let listener = TcpListener::bind(bind)?;
        let mut announced = listener.local_addr()?;
        if announced.ip().is_unspecified() {
            warn!(bind = %bind, "unspecified bind address, announcing loopback");
            announced.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        let identifier = ParticipantIdentifier::new(id, name, ParticipantAddress::Socket(announced));

        Ok(TcpTransport {
            identifier,
            registry,
            listener: Mutex::new(Some(listener)),
            acceptor: Mutex::new(None),
            shared: Arc::new(Shared {
                local: id,
                links: Mutex::new(HashMap::new()),
                handler: RwLock::new(None),
                running: AtomicBool::new(false),
                next_link: AtomicU64::new(1),
                streams: Mutex::new(HashMap::new()),
                readers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.identifier.address.socket()
    }

    fn writer(&self, peer: ParticipantId) -> Option<(u64, Arc<Mutex<TcpStream>>)> {
        self.shared
            .links
            .lock()
            .get(&peer)
            .map(|l| (l.id, l.writer.clone()))
    }

    /// Close the registered link to `peer`
    ///
    /// Without a link id every stream of the peer is shut down, read-only
    /// duplicates included, so the remote's registered link observes the
    /// disconnect whichever stream it writes on.
    fn drop_link(&self, peer: ParticipantId, link_id: Option<u64>) {
        let removed = {
            let mut links = self.shared.links.lock();
            match links.get(&peer) {
                Some(link) if link_id.map_or(true, |id| id == link.id) => links.remove(&peer),
                _ => None,
            }
        };
        if let Some(link) = removed {
            let _ = link.writer.lock().shutdown(Shutdown::Both);
        }
        if link_id.is_none() {
            let streams = self.shared.streams.lock();
            let duplicates = streams.values().filter(|(owner, _)| *owner == peer);
            for (_, stream) in duplicates {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Transport for TcpTransport {
    fn local_identifier(&self) -> &ParticipantIdentifier {
        &self.identifier
    }

    fn start(&self, handler: Arc<dyn TransportHandler>) -> SceneCastResult<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };
        *self.shared.handler.write() = Some(handler);
        listener.set_nonblocking(true)?;
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("scenecast-tcp-accept-{}", self.identifier.id))
            .spawn(move || shared.accept_loop(listener))?;
        *self.acceptor.lock() = Some(handle);

        info!(participant = %self.identifier, "tcp transport listening");
        Ok(())
    }

    fn connect(&self, peer: ParticipantId) -> SceneCastResult<()> {
        if self.shared.links.lock().contains_key(&peer) {
            return Ok(());
        }
        let addr = self
            .registry
            .resolve(peer)
            .and_then(|a| a.socket())
            .ok_or_else(|| SceneCastError::transport(peer, "no network address known"))?;

        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| SceneCastError::transport(peer, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SceneCastError::transport(peer, e))?;
        write_frame(&mut stream, &encode_preamble(self.identifier.id))
            .map_err(|e| SceneCastError::transport(peer, e))?;

        debug!(local = %self.identifier.id, peer = %peer, remote = %addr, "outbound link");
        self.shared.add_link(peer, stream)
    }

    fn send(&self, peer: ParticipantId, payload: &[u8]) -> SceneCastResult<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(SceneCastError::MessageTooLarge(payload.len()));
        }
        let (link_id, writer) = self
            .writer(peer)
            .ok_or_else(|| SceneCastError::transport(peer, "not connected"))?;
        let result = write_frame(&mut *writer.lock(), payload);
        result.map_err(|err| {
            self.drop_link(peer, Some(link_id));
            SceneCastError::transport(peer, err)
        })
    }

    fn disconnect(&self, peer: ParticipantId) {
        self.drop_link(peer, None);
    }

    fn is_connected(&self, peer: ParticipantId) -> bool {
        self.shared.links.lock().contains_key(&peer)
    }

    fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        self.shared.links.lock().clear();
        let streams: Vec<TcpStream> = self.shared.streams.lock().drain().map(|(_, (_, s))| s).collect();
        for stream in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let readers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.readers.lock());
        for handle in readers {
            let _ = handle.join();
        }
        info!(participant = %self.identifier, "tcp transport stopped");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

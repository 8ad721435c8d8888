//! Session messages and their binary encoding
//!
//! Strings are length-prefixed (u16), command buffers are length-prefixed
//! (u32), deadlines use zero as the "no deadline" sentinel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use scenecast_core::{
    Flush, FlushTime, ParticipantAddress, ParticipantId, ParticipantIdentifier, SceneCastError,
    SceneCastResult, SceneId, SequenceNumber,
};

use crate::framing::MAX_FRAME_SIZE;

/// Current wire version
pub const WIRE_VERSION: u8 = 1;

/// Envelope size (version + type)
pub const ENVELOPE_SIZE: usize = 2;

/// Largest encoded message; every message travels in one stream frame
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE as usize;

/// Encoded flush without name bytes and commands
const FLUSH_FIXED_SIZE: usize = ENVELOPE_SIZE + 8 + 8 + 8 + 1 + 4;

/// Reject a flush that could not be encoded; returns its encoded size
///
/// Producers call this before a sequence number is assigned, so a flush
/// that cannot travel never leaves a gap in the stream.
pub fn check_flush_size(name: Option<&str>, commands: usize) -> SceneCastResult<usize> {
    let name_size = match name {
        Some(name) => {
            if name.len() > u16::MAX as usize {
                return Err(SceneCastError::MessageTooLarge(name.len()));
            }
            2 + name.len()
        }
        None => 0,
    };
    let size = FLUSH_FIXED_SIZE
        .saturating_add(name_size)
        .saturating_add(commands);
    if size > MAX_MESSAGE_SIZE {
        return Err(SceneCastError::MessageTooLarge(size));
    }
    Ok(size)
}

/// Message type discriminants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Alive = 0x02,
    Goodbye = 0x03,
    Announce = 0x10,
    PeerList = 0x11,
    PeerJoined = 0x12,
    PeerLeft = 0x13,
    PublishScene = 0x20,
    UnpublishScene = 0x21,
    SubscribeScene = 0x22,
    UnsubscribeScene = 0x23,
    SceneNotAvailable = 0x24,
    SubscriptionAccepted = 0x25,
    Flush = 0x30,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageType::Hello),
            0x02 => Some(MessageType::Alive),
            0x03 => Some(MessageType::Goodbye),
            0x10 => Some(MessageType::Announce),
            0x11 => Some(MessageType::PeerList),
            0x12 => Some(MessageType::PeerJoined),
            0x13 => Some(MessageType::PeerLeft),
            0x20 => Some(MessageType::PublishScene),
            0x21 => Some(MessageType::UnpublishScene),
            0x22 => Some(MessageType::SubscribeScene),
            0x23 => Some(MessageType::UnsubscribeScene),
            0x24 => Some(MessageType::SceneNotAvailable),
            0x25 => Some(MessageType::SubscriptionAccepted),
            0x30 => Some(MessageType::Flush),
            _ => None,
        }
    }
}

/// A session-level message between two participants, or between a
/// participant and the discovery daemon
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Connection handshake
    Hello {
        identifier: ParticipantIdentifier,
        protocol_version: u32,
    },
    /// Keep-alive heartbeat
    Alive,
    /// Orderly departure
    Goodbye,
    /// Participant -> daemon registration
    Announce {
        identifier: ParticipantIdentifier,
        protocol_version: u32,
    },
    /// Daemon -> newcomer: everyone currently visible
    PeerList(Vec<ParticipantIdentifier>),
    /// Daemon -> others: a participant arrived
    PeerJoined(ParticipantIdentifier),
    /// Daemon -> others: a participant departed
    PeerLeft(ParticipantId),
    PublishScene(SceneId),
    UnpublishScene(SceneId),
    SubscribeScene(SceneId),
    UnsubscribeScene(SceneId),
    SceneNotAvailable(SceneId),
    /// Provider -> consumer: first sequence number the consumer will see
    SubscriptionAccepted {
        scene: SceneId,
        next_sequence: SequenceNumber,
    },
    Flush(Flush),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Alive => MessageType::Alive,
            Message::Goodbye => MessageType::Goodbye,
            Message::Announce { .. } => MessageType::Announce,
            Message::PeerList(_) => MessageType::PeerList,
            Message::PeerJoined(_) => MessageType::PeerJoined,
            Message::PeerLeft(_) => MessageType::PeerLeft,
            Message::PublishScene(_) => MessageType::PublishScene,
            Message::UnpublishScene(_) => MessageType::UnpublishScene,
            Message::SubscribeScene(_) => MessageType::SubscribeScene,
            Message::UnsubscribeScene(_) => MessageType::UnsubscribeScene,
            Message::SceneNotAvailable(_) => MessageType::SceneNotAvailable,
            Message::SubscriptionAccepted { .. } => MessageType::SubscriptionAccepted,
            Message::Flush(_) => MessageType::Flush,
        }
    }

    /// Serialize into a fresh buffer
    ///
    /// Fails with `MessageTooLarge` when the result would not fit in
    /// [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> SceneCastResult<Bytes> {
        let capacity = match self {
            Message::Flush(flush) => check_flush_size(flush.name.as_deref(), flush.commands.len())?,
            _ => 64,
        };
        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.message_type() as u8);

        match self {
            Message::Hello {
                identifier,
                protocol_version,
            }
            | Message::Announce {
                identifier,
                protocol_version,
            } => {
                put_identifier(&mut buf, identifier)?;
                buf.put_u32_le(*protocol_version);
            }
            Message::Alive | Message::Goodbye => {}
            Message::PeerList(peers) => {
                let count = u16::try_from(peers.len())
                    .map_err(|_| SceneCastError::MessageTooLarge(peers.len()))?;
                buf.put_u16_le(count);
                for peer in peers {
                    put_identifier(&mut buf, peer)?;
                }
            }
            Message::PeerJoined(identifier) => put_identifier(&mut buf, identifier)?,
            Message::PeerLeft(id) => buf.put_u64_le(id.0),
            Message::PublishScene(scene)
            | Message::UnpublishScene(scene)
            | Message::SubscribeScene(scene)
            | Message::UnsubscribeScene(scene)
            | Message::SceneNotAvailable(scene) => buf.put_u64_le(scene.0),
            Message::SubscriptionAccepted {
                scene,
                next_sequence,
            } => {
                buf.put_u64_le(scene.0);
                buf.put_u64_le(next_sequence.0);
            }
            Message::Flush(flush) => put_flush(&mut buf, flush)?,
        }

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(SceneCastError::MessageTooLarge(buf.len()));
        }
        Ok(buf.freeze())
    }

    /// Parse a message from an encoded buffer
    pub fn decode(buf: &[u8]) -> SceneCastResult<Self> {
        let mut reader = Reader::new(buf);
        let version = reader.u8()?;
        if version != WIRE_VERSION {
            return Err(SceneCastError::InvalidWireFormat(format!(
                "unsupported wire version {}",
                version
            )));
        }
        let type_byte = reader.u8()?;
        let message_type =
            MessageType::from_byte(type_byte).ok_or(SceneCastError::UnknownMessageType(type_byte))?;

        let message = match message_type {
            MessageType::Hello => Message::Hello {
                identifier: reader.identifier()?,
                protocol_version: reader.u32()?,
            },
            MessageType::Announce => Message::Announce {
                identifier: reader.identifier()?,
                protocol_version: reader.u32()?,
            },
            MessageType::Alive => Message::Alive,
            MessageType::Goodbye => Message::Goodbye,
            MessageType::PeerList => {
                let count = reader.u16()? as usize;
                let mut peers = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    peers.push(reader.identifier()?);
                }
                Message::PeerList(peers)
            }
            MessageType::PeerJoined => Message::PeerJoined(reader.identifier()?),
            MessageType::PeerLeft => Message::PeerLeft(ParticipantId(reader.u64()?)),
            MessageType::PublishScene => Message::PublishScene(SceneId(reader.u64()?)),
            MessageType::UnpublishScene => Message::UnpublishScene(SceneId(reader.u64()?)),
            MessageType::SubscribeScene => Message::SubscribeScene(SceneId(reader.u64()?)),
            MessageType::UnsubscribeScene => Message::UnsubscribeScene(SceneId(reader.u64()?)),
            MessageType::SceneNotAvailable => Message::SceneNotAvailable(SceneId(reader.u64()?)),
            MessageType::SubscriptionAccepted => Message::SubscriptionAccepted {
                scene: SceneId(reader.u64()?),
                next_sequence: SequenceNumber(reader.u64()?),
            },
            MessageType::Flush => Message::Flush(reader.flush()?),
        };

        if reader.remaining() != 0 {
            return Err(SceneCastError::InvalidWireFormat(format!(
                "{} trailing bytes after {:?}",
                reader.remaining(),
                message_type
            )));
        }
        Ok(message)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> SceneCastResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| SceneCastError::MessageTooLarge(s.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_identifier(buf: &mut BytesMut, identifier: &ParticipantIdentifier) -> SceneCastResult<()> {
    buf.put_u64_le(identifier.id.0);
    put_str(buf, &identifier.name)?;
    match identifier.address {
        ParticipantAddress::Local => buf.put_u8(0),
        ParticipantAddress::Socket(SocketAddr::V4(addr)) => {
            buf.put_u8(4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16_le(addr.port());
        }
        ParticipantAddress::Socket(SocketAddr::V6(addr)) => {
            buf.put_u8(6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16_le(addr.port());
        }
    }
    Ok(())
}

fn put_flush(buf: &mut BytesMut, flush: &Flush) -> SceneCastResult<()> {
    buf.put_u64_le(flush.scene.0);
    buf.put_u64_le(flush.sequence.0);
    buf.put_u64_le(FlushTime::to_wire(flush.deadline));
    match &flush.name {
        Some(name) => {
            buf.put_u8(1);
            put_str(buf, name)?;
        }
        None => buf.put_u8(0),
    }
    let len = u32::try_from(flush.commands.len())
        .map_err(|_| SceneCastError::MessageTooLarge(flush.commands.len()))?;
    buf.put_u32_le(len);
    buf.put_slice(&flush.commands);
    Ok(())
}

/// Bounds-checked little-endian reader
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> SceneCastResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(SceneCastError::BufferTooShort {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> SceneCastResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> SceneCastResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> SceneCastResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> SceneCastResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> SceneCastResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> SceneCastResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SceneCastError::InvalidWireFormat("string is not UTF-8".into()))
    }

    fn identifier(&mut self) -> SceneCastResult<ParticipantIdentifier> {
        let id = ParticipantId(self.u64()?);
        let name = self.string()?;
        let address = match self.u8()? {
            0 => ParticipantAddress::Local,
            4 => {
                let ip = Ipv4Addr::from(self.array::<4>()?);
                let port = self.u16()?;
                ParticipantAddress::Socket(SocketAddr::new(IpAddr::V4(ip), port))
            }
            6 => {
                let ip = Ipv6Addr::from(self.array::<16>()?);
                let port = self.u16()?;
                ParticipantAddress::Socket(SocketAddr::new(IpAddr::V6(ip), port))
            }
            other => {
                return Err(SceneCastError::InvalidWireFormat(format!(
                    "unknown address kind {}",
                    other
                )))
            }
        };
        Ok(ParticipantIdentifier { id, name, address })
    }

    fn flush(&mut self) -> SceneCastResult<Flush> {
        let scene = SceneId(self.u64()?);
        let sequence = SequenceNumber(self.u64()?);
        let deadline = FlushTime::from_wire(self.u64()?);
        let name = match self.u8()? {
            0 => None,
            1 => Some(self.string()?),
            other => {
                return Err(SceneCastError::InvalidWireFormat(format!(
                    "invalid name flag {}",
                    other
                )))
            }
        };
        let len = self.u32()? as usize;
        let commands = Bytes::copy_from_slice(self.take(len)?);
        Ok(Flush {
            scene,
            sequence,
            name,
            commands,
            deadline,
        })
    }
}

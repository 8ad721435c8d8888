//! Identity types for SceneCast
//!
//! All identifiers are 64-bit; participant ids are drawn at random when
//! the configuration does not pin one.

use std::fmt;

use rand::Rng;

/// Participant identity - unique per process in the mesh
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    pub const ZERO: ParticipantId = ParticipantId(0);

    /// Well-known id of the discovery daemon
    pub const DAEMON: ParticipantId = ParticipantId(0xBBBC_4FDF_44E4_4EE9);

    #[inline]
    pub fn new(id: u64) -> Self {
        ParticipantId(id)
    }

    /// Draw a random id that collides with neither `ZERO` nor `DAEMON`
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id = ParticipantId(rng.gen());
            if id != Self::ZERO && id != Self::DAEMON {
                return id;
            }
        }
    }

    #[inline]
    pub fn is_daemon(self) -> bool {
        self == Self::DAEMON
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        ParticipantId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Participant({:016x})", self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Scene identity - chosen by the producing application
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SceneId(pub u64);

impl SceneId {
    #[inline]
    pub fn new(id: u64) -> Self {
        SceneId(id)
    }
}

impl fmt::Debug for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scene({})", self.0)
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-scene flush sequence number
///
/// The first flush of a scene carries `SequenceNumber::FIRST`; zero is
/// never assigned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    #[inline]
    pub fn new(seq: u64) -> Self {
        SequenceNumber(seq)
    }

    #[inline]
    pub fn next(self) -> Self {
        SequenceNumber(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

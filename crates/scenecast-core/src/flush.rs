//! Flushes - immutable, sequence-numbered batches of scene commands

use bytes::Bytes;

use crate::{FlushTime, SceneId, SequenceNumber};

/// One batch of scene mutations
///
/// The command buffer is opaque to the session layer; only the producing
/// and rendering applications agree on its encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flush {
    pub scene: SceneId,
    pub sequence: SequenceNumber,
    /// Optional named checkpoint (version tag)
    pub name: Option<String>,
    pub commands: Bytes,
    /// Freshness deadline; `None` disables expiration monitoring
    pub deadline: Option<FlushTime>,
}

impl Flush {
    pub fn new(scene: SceneId, sequence: SequenceNumber, commands: impl Into<Bytes>) -> Self {
        Flush {
            scene,
            sequence,
            name: None,
            commands: commands.into(),
            deadline: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Option<FlushTime>) -> Self {
        self.deadline = deadline;
        self
    }

    /// A flush that carries no commands leaves the scene content unchanged
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

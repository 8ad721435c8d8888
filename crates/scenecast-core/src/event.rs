//! Consumer-facing session events
//!
//! Events are queued inside a participant and handed to the hosting
//! application on its own thread through a [`SceneEventHandler`].

use bytes::Bytes;

use crate::{ParticipantId, SceneId, SequenceNumber};

/// Something the rendering application should know about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SceneEvent {
    /// A flush was applied in sequence order
    FlushApplied {
        scene: SceneId,
        sequence: SequenceNumber,
        name: Option<String>,
        commands: Bytes,
    },
    /// Presented content is past its deadline
    SceneExpired(SceneId),
    /// Presented content is back within its deadline
    SceneRecovered(SceneId),
    /// A remote participant became reachable
    ParticipantConnected(ParticipantId),
    /// A remote participant departed; its subscriptions are gone
    ParticipantLost(ParticipantId),
    /// A provider announced a scene
    ScenePublished { scene: SceneId, provider: ParticipantId },
    /// A provider withdrew a scene
    SceneUnpublished { scene: SceneId, provider: ParticipantId },
    /// A subscription request was refused by the provider
    SceneUnavailable(SceneId),
}

impl SceneEvent {
    /// Scene this event concerns, if any
    pub fn scene(&self) -> Option<SceneId> {
        match self {
            SceneEvent::FlushApplied { scene, .. }
            | SceneEvent::ScenePublished { scene, .. }
            | SceneEvent::SceneUnpublished { scene, .. } => Some(*scene),
            SceneEvent::SceneExpired(scene)
            | SceneEvent::SceneRecovered(scene)
            | SceneEvent::SceneUnavailable(scene) => Some(*scene),
            SceneEvent::ParticipantConnected(_) | SceneEvent::ParticipantLost(_) => None,
        }
    }

    /// Route this event to the matching handler method
    pub fn dispatch<H: SceneEventHandler + ?Sized>(self, handler: &mut H) {
        match self {
            SceneEvent::FlushApplied {
                scene,
                sequence,
                name,
                commands,
            } => handler.flush_applied(scene, sequence, name.as_deref(), &commands),
            SceneEvent::SceneExpired(scene) => handler.scene_expired(scene),
            SceneEvent::SceneRecovered(scene) => handler.scene_recovered(scene),
            SceneEvent::ParticipantConnected(id) => handler.participant_connected(id),
            SceneEvent::ParticipantLost(id) => handler.participant_lost(id),
            SceneEvent::ScenePublished { scene, provider } => handler.scene_published(scene, provider),
            SceneEvent::SceneUnpublished { scene, provider } => {
                handler.scene_unpublished(scene, provider)
            }
            SceneEvent::SceneUnavailable(scene) => handler.scene_unavailable(scene),
        }
    }
}

/// Callbacks for the rendering application; every method defaults to a no-op
pub trait SceneEventHandler {
    fn flush_applied(
        &mut self,
        _scene: SceneId,
        _sequence: SequenceNumber,
        _name: Option<&str>,
        _commands: &Bytes,
    ) {
    }

    fn scene_expired(&mut self, _scene: SceneId) {}

    fn scene_recovered(&mut self, _scene: SceneId) {}

    fn participant_connected(&mut self, _participant: ParticipantId) {}

    fn participant_lost(&mut self, _participant: ParticipantId) {}

    fn scene_published(&mut self, _scene: SceneId, _provider: ParticipantId) {}

    fn scene_unpublished(&mut self, _scene: SceneId, _provider: ParticipantId) {}

    fn scene_unavailable(&mut self, _scene: SceneId) {}
}

//! Event recording for assertions

use bytes::Bytes;
use scenecast_core::{ParticipantId, SceneEvent, SceneEventHandler, SceneId, SequenceNumber};

/// Handler that keeps every dispatched event in arrival order
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Vec<SceneEvent>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SceneEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Applied sequence numbers of `scene`, in application order
    pub fn applied(&self, scene: SceneId) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SceneEvent::FlushApplied {
                    scene: s, sequence, ..
                } if *s == scene => Some(sequence.value()),
                _ => None,
            })
            .collect()
    }

    pub fn has_applied(&self, scene: SceneId, sequence: SequenceNumber) -> bool {
        self.applied(scene).contains(&sequence.value())
    }

    pub fn expirations(&self, scene: SceneId) -> usize {
        self.count(&SceneEvent::SceneExpired(scene))
    }

    pub fn recoveries(&self, scene: SceneId) -> usize {
        self.count(&SceneEvent::SceneRecovered(scene))
    }

    /// Every scene that appears in an expiration or recovery event
    pub fn expiration_scenes(&self) -> Vec<SceneId> {
        let mut scenes: Vec<SceneId> = self
            .events
            .iter()
            .filter_map(|event| match event {
                SceneEvent::SceneExpired(scene) | SceneEvent::SceneRecovered(scene) => Some(*scene),
                _ => None,
            })
            .collect();
        scenes.sort();
        scenes.dedup();
        scenes
    }

    pub fn connected(&self, peer: ParticipantId) -> usize {
        self.count(&SceneEvent::ParticipantConnected(peer))
    }

    pub fn lost(&self, peer: ParticipantId) -> usize {
        self.count(&SceneEvent::ParticipantLost(peer))
    }

    pub fn published(&self, scene: SceneId) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, SceneEvent::ScenePublished { scene: s, .. } if *s == scene))
    }

    pub fn unpublished(&self, scene: SceneId) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, SceneEvent::SceneUnpublished { scene: s, .. } if *s == scene))
    }

    fn count(&self, wanted: &SceneEvent) -> usize {
        self.events.iter().filter(|event| *event == wanted).count()
    }
}

impl SceneEventHandler for RecordingHandler {
    fn flush_applied(
        &mut self,
        scene: SceneId,
        sequence: SequenceNumber,
        name: Option<&str>,
        commands: &Bytes,
    ) {
        self.events.push(SceneEvent::FlushApplied {
            scene,
            sequence,
            name: name.map(str::to_owned),
            commands: commands.clone(),
        });
    }

    fn scene_expired(&mut self, scene: SceneId) {
        self.events.push(SceneEvent::SceneExpired(scene));
    }

    fn scene_recovered(&mut self, scene: SceneId) {
        self.events.push(SceneEvent::SceneRecovered(scene));
    }

    fn participant_connected(&mut self, participant: ParticipantId) {
        self.events.push(SceneEvent::ParticipantConnected(participant));
    }

    fn participant_lost(&mut self, participant: ParticipantId) {
        self.events.push(SceneEvent::ParticipantLost(participant));
    }

    fn scene_published(&mut self, scene: SceneId, provider: ParticipantId) {
        self.events.push(SceneEvent::ScenePublished { scene, provider });
    }

    fn scene_unpublished(&mut self, scene: SceneId, provider: ParticipantId) {
        self.events.push(SceneEvent::SceneUnpublished { scene, provider });
    }

    fn scene_unavailable(&mut self, scene: SceneId) {
        self.events.push(SceneEvent::SceneUnavailable(scene));
    }
}

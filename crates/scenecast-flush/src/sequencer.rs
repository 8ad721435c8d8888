//! Producer-side sequence assignment

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use scenecast_core::{Flush, FlushTime, SceneCastError, SceneCastResult, SceneId, SequenceNumber};
use tracing::{debug, trace};

#[derive(Debug)]
struct ProducerScene {
    next: SequenceNumber,
    published: bool,
}

/// Assigns sequence numbers atomically with flush creation
///
/// The dispatch closure passed to [`FlushSequencer::create_flush`] runs
/// under the sequencer lock, so flushes reach the dispatcher in sequence
/// order even when several threads produce for the same scene. A number is
/// consumed only when dispatch succeeds. Counters survive unpublish, so a
/// republished scene never reuses a number.
#[derive(Debug, Default)]
pub struct FlushSequencer {
    scenes: Mutex<HashMap<SceneId, ProducerScene>>,
}

impl FlushSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a scene for flushing and hand its next sequence number to `announce`
    pub fn register_scene<F>(&self, scene: SceneId, announce: F) -> SceneCastResult<SequenceNumber>
    where
        F: FnOnce(SequenceNumber) -> SceneCastResult<()>,
    {
        let mut scenes = self.scenes.lock();
        let entry = scenes.entry(scene).or_insert(ProducerScene {
            next: SequenceNumber::FIRST,
            published: false,
        });
        entry.published = true;
        let next = entry.next;
        announce(next)?;
        Ok(next)
    }

    /// Close a scene; its counter is retained
    pub fn unregister_scene<F>(&self, scene: SceneId, announce: F) -> SceneCastResult<()>
    where
        F: FnOnce() -> SceneCastResult<()>,
    {
        let mut scenes = self.scenes.lock();
        match scenes.get_mut(&scene) {
            Some(entry) if entry.published => {
                entry.published = false;
                announce()
            }
            _ => Err(SceneCastError::SceneNotPublished(scene)),
        }
    }

    /// Build the next flush for `scene` and pass it to `dispatch`
    pub fn create_flush<F>(
        &self,
        scene: SceneId,
        commands: Bytes,
        name: Option<String>,
        deadline: Option<FlushTime>,
        dispatch: F,
    ) -> SceneCastResult<SequenceNumber>
    where
        F: FnOnce(Flush) -> SceneCastResult<()>,
    {
        let mut scenes = self.scenes.lock();
        let entry = match scenes.get_mut(&scene) {
            Some(entry) if entry.published => entry,
            _ => return Err(SceneCastError::SceneNotPublished(scene)),
        };

        let sequence = entry.next;
        let flush = Flush {
            scene,
            sequence,
            name,
            commands,
            deadline,
        };
        if let Err(err) = dispatch(flush) {
            debug!(scene = %scene, sequence = %sequence, error = %err, "flush not dispatched");
            return Err(err);
        }
        entry.next = sequence.next();
        trace!(scene = %scene, sequence = %sequence, "flush dispatched");
        Ok(sequence)
    }

    pub fn is_published(&self, scene: SceneId) -> bool {
        self.scenes.lock().get(&scene).map_or(false, |s| s.published)
    }

    /// Sequence number the next flush of `scene` will carry
    pub fn next_sequence(&self, scene: SceneId) -> Option<SequenceNumber> {
        self.scenes.lock().get(&scene).map(|s| s.next)
    }

    pub fn published_scenes(&self) -> Vec<SceneId> {
        let mut scenes: Vec<SceneId> = self
            .scenes
            .lock()
            .iter()
            .filter(|(_, s)| s.published)
            .map(|(id, _)| *id)
            .collect();
        scenes.sort();
        scenes
    }
}

//! Consumer-side scene subscriptions

use std::fmt;

use scenecast_core::{Flush, ParticipantId, SceneCastError, SceneCastResult, SceneId, SequenceNumber};

use crate::{FlushReceiver, DEFAULT_MAX_PENDING_FLUSHES};

/// How far a scene has been brought towards the screen
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VisibilityState {
    Unsubscribed,
    Subscribed,
    Mapped,
    Shown,
}

impl fmt::Display for VisibilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VisibilityState::Unsubscribed => "Unsubscribed",
            VisibilityState::Subscribed => "Subscribed",
            VisibilityState::Mapped => "Mapped",
            VisibilityState::Shown => "Shown",
        };
        f.write_str(name)
    }
}

/// One consumer's subscription to one provider's scene
#[derive(Debug)]
pub struct SceneSubscription {
    pub scene: SceneId,
    pub provider: ParticipantId,
    pub consumer: ParticipantId,
    visibility: VisibilityState,
    receiver: FlushReceiver,
}

impl SceneSubscription {
    pub fn new(scene: SceneId, provider: ParticipantId, consumer: ParticipantId) -> Self {
        Self::with_limit(scene, provider, consumer, DEFAULT_MAX_PENDING_FLUSHES)
    }

    /// Subscription whose reorder buffer holds at most `max_pending` flushes
    pub fn with_limit(
        scene: SceneId,
        provider: ParticipantId,
        consumer: ParticipantId,
        max_pending: usize,
    ) -> Self {
        SceneSubscription {
            scene,
            provider,
            consumer,
            visibility: VisibilityState::Subscribed,
            receiver: FlushReceiver::with_limit(scene, max_pending),
        }
    }

    pub fn visibility(&self) -> VisibilityState {
        self.visibility
    }

    pub fn highest_applied(&self) -> Option<SequenceNumber> {
        self.receiver.highest_applied()
    }

    pub fn is_shown(&self) -> bool {
        self.visibility == VisibilityState::Shown
    }

    /// Subscribed -> Mapped
    pub fn map(&mut self) -> SceneCastResult<()> {
        self.transition(VisibilityState::Subscribed, VisibilityState::Mapped)
    }

    /// Mapped -> Subscribed
    pub fn unmap(&mut self) -> SceneCastResult<()> {
        self.transition(VisibilityState::Mapped, VisibilityState::Subscribed)
    }

    /// Mapped -> Shown
    pub fn show(&mut self) -> SceneCastResult<()> {
        self.transition(VisibilityState::Mapped, VisibilityState::Shown)
    }

    /// Shown -> Mapped
    pub fn hide(&mut self) -> SceneCastResult<()> {
        self.transition(VisibilityState::Shown, VisibilityState::Mapped)
    }

    fn transition(&mut self, from: VisibilityState, to: VisibilityState) -> SceneCastResult<()> {
        if self.visibility != from {
            return Err(SceneCastError::InvalidSceneState {
                scene: self.scene,
                state: self.visibility.to_string(),
            });
        }
        self.visibility = to;
        Ok(())
    }

    pub fn start_at(&mut self, first: SequenceNumber) -> Vec<Flush> {
        self.receiver.start_at(first)
    }

    pub fn offer(&mut self, flush: Flush) -> SceneCastResult<Vec<Flush>> {
        self.receiver.offer(flush)
    }

    pub fn receiver(&self) -> &FlushReceiver {
        &self.receiver
    }
}

//! Per-scene content expiration
//!
//! Each monitored scene tracks two deadlines:
//! - `applied`: deadline of the most recently applied flush
//! - `presented`: deadline of the content at its last presentation instant
//!
//! While a scene is shown, the presentation instant is a completed render,
//! so `presented` only moves on [`ExpirationMonitor::on_rendered`]. Otherwise
//! the presentation instant is flush application and `presented` follows
//! `applied` directly. Hiding a scene switches back to the application rule
//! immediately.
//!
//! Phases move `NotMonitored <-> OnTime`, `OnTime -> Expired`,
//! `Expired -> Recovered -> OnTime`. `Recovered` is held until the next
//! check, which moves it to `OnTime` before evaluating again.

use std::collections::BTreeMap;

use scenecast_core::{FlushTime, SceneId};
use tracing::debug;

/// Expiration phase of one scene
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpirationPhase {
    NotMonitored,
    OnTime,
    Expired,
    Recovered,
}

/// Transition emitted by [`ExpirationMonitor::check_expired`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpirationEvent {
    Expired(SceneId),
    Recovered(SceneId),
}

impl ExpirationEvent {
    pub fn scene(&self) -> SceneId {
        match self {
            ExpirationEvent::Expired(scene) | ExpirationEvent::Recovered(scene) => *scene,
        }
    }
}

/// Expiration state of one scene
#[derive(Clone, Debug)]
struct ExpirationState {
    applied: Option<FlushTime>,
    presented: Option<FlushTime>,
    shown: bool,
    phase: ExpirationPhase,
}

impl ExpirationState {
    fn new() -> Self {
        ExpirationState {
            applied: None,
            presented: None,
            shown: false,
            phase: ExpirationPhase::NotMonitored,
        }
    }

    fn apply_deadline(&mut self, deadline: Option<FlushTime>) {
        match deadline {
            None => {
                self.applied = None;
                self.presented = None;
                self.phase = ExpirationPhase::NotMonitored;
            }
            Some(deadline) => {
                self.applied = Some(deadline);
                if !self.shown {
                    self.presented = Some(deadline);
                }
                if self.phase == ExpirationPhase::NotMonitored {
                    self.phase = ExpirationPhase::OnTime;
                }
            }
        }
    }

    fn present(&mut self) {
        self.presented = self.applied;
    }

    fn evaluate(&mut self, now: FlushTime) -> Option<bool> {
        if self.phase == ExpirationPhase::NotMonitored {
            return None;
        }
        if self.phase == ExpirationPhase::Recovered {
            self.phase = ExpirationPhase::OnTime;
        }
        let deadline = self.presented?;

        if now > deadline {
            if self.phase != ExpirationPhase::Expired {
                self.phase = ExpirationPhase::Expired;
                return Some(true);
            }
        } else if self.phase == ExpirationPhase::Expired {
            self.phase = ExpirationPhase::Recovered;
            return Some(false);
        }
        None
    }
}

/// Consumer-side expiration state machine for all subscribed scenes
#[derive(Debug, Default)]
pub struct ExpirationMonitor {
    scenes: BTreeMap<SceneId, ExpirationState>,
}

impl ExpirationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flush was applied; `None` stops monitoring until a deadline returns
    pub fn on_flush_applied(&mut self, scene: SceneId, deadline: Option<FlushTime>) {
        let state = self.scenes.entry(scene).or_insert_with(ExpirationState::new);
        if deadline.is_none() && state.phase != ExpirationPhase::NotMonitored {
            debug!(scene = %scene, "expiration monitoring disabled");
        }
        state.apply_deadline(deadline);
    }

    /// The scene's latest content completed a render
    pub fn on_rendered(&mut self, scene: SceneId) {
        if let Some(state) = self.scenes.get_mut(&scene) {
            if state.shown {
                state.present();
            }
        }
    }

    pub fn on_shown(&mut self, scene: SceneId) {
        self.scenes
            .entry(scene)
            .or_insert_with(ExpirationState::new)
            .shown = true;
    }

    /// Switch back to the flush-application rule
    pub fn on_hidden(&mut self, scene: SceneId) {
        if let Some(state) = self.scenes.get_mut(&scene) {
            state.shown = false;
            state.present();
        }
    }

    /// Forget a scene entirely (unsubscribe, provider lost)
    pub fn stop_monitoring(&mut self, scene: SceneId) {
        self.scenes.remove(&scene);
    }

    /// Evaluate every scene once; returns the transitions in scene order
    pub fn check_expired(&mut self, now: FlushTime) -> Vec<ExpirationEvent> {
        let mut events = Vec::new();
        for (scene, state) in self.scenes.iter_mut() {
            match state.evaluate(now) {
                Some(true) => {
                    debug!(scene = %scene, deadline = ?state.presented, "scene expired");
                    events.push(ExpirationEvent::Expired(*scene));
                }
                Some(false) => {
                    debug!(scene = %scene, deadline = ?state.presented, "scene recovered");
                    events.push(ExpirationEvent::Recovered(*scene));
                }
                None => {}
            }
        }
        events
    }

    pub fn phase(&self, scene: SceneId) -> ExpirationPhase {
        self.scenes
            .get(&scene)
            .map_or(ExpirationPhase::NotMonitored, |s| s.phase)
    }

    /// Deadline currently compared against, if the scene is monitored
    pub fn effective_deadline(&self, scene: SceneId) -> Option<FlushTime> {
        self.scenes.get(&scene).and_then(|s| s.presented)
    }

    pub fn is_monitored(&self, scene: SceneId) -> bool {
        self.phase(scene) != ExpirationPhase::NotMonitored
    }
}

//! Consumer side of a participant
//!
//! Owned by the hosting application's thread. Items produced by the
//! connection manager are queued and only applied when the host ticks
//! (`update`, `do_one_loop`), so flush application, render bookkeeping and
//! expiration checks all run on the host's thread in a fixed order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use scenecast_core::{
    Flush, FlushTime, ParticipantId, SceneCastError, SceneCastResult, SceneEvent, SceneEventHandler,
    SceneId,
};
use scenecast_flush::{SceneSubscription, VisibilityState};
use scenecast_time::{ExpirationEvent, ExpirationMonitor, ExpirationPhase};
use tracing::{debug, trace, warn};

use crate::manager::{Command, Inbound, ManagerEvent};

/// What a host tick does besides applying updates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopMode {
    UpdateAndRender,
    UpdateOnly,
}

/// Counters for the consumer side
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub flushes_applied: u64,
    pub flushes_discarded: u64,
    pub expirations: u64,
    pub recoveries: u64,
}

pub struct SceneConsumer {
    local: ParticipantId,
    inbound: Receiver<Inbound>,
    /// Items taken off the channel by `wait_for_update` but not yet applied
    early: VecDeque<Inbound>,
    commands: Sender<ManagerEvent>,
    available: HashMap<SceneId, ParticipantId>,
    subscriptions: BTreeMap<SceneId, SceneSubscription>,
    max_pending_flushes: usize,
    /// Providers asked to be reset and not yet reported lost
    resetting: HashSet<ParticipantId>,
    monitor: ExpirationMonitor,
    events: VecDeque<SceneEvent>,
    stats: ConsumerStats,
}

impl SceneConsumer {
    pub fn new(
        local: ParticipantId,
        inbound: Receiver<Inbound>,
        commands: Sender<ManagerEvent>,
        max_pending_flushes: usize,
    ) -> Self {
        SceneConsumer {
            local,
            inbound,
            early: VecDeque::new(),
            commands,
            available: HashMap::new(),
            subscriptions: BTreeMap::new(),
            max_pending_flushes,
            resetting: HashSet::new(),
            monitor: ExpirationMonitor::new(),
            events: VecDeque::new(),
            stats: ConsumerStats::default(),
        }
    }

    fn command(&self, command: Command) -> SceneCastResult<()> {
        self.commands
            .send(ManagerEvent::Command(command))
            .map_err(|_| SceneCastError::SchedulerStopped)
    }

    /// Scenes announced by connected providers
    pub fn available_scenes(&self) -> Vec<(SceneId, ParticipantId)> {
        let mut scenes: Vec<(SceneId, ParticipantId)> =
            self.available.iter().map(|(s, p)| (*s, *p)).collect();
        scenes.sort();
        scenes
    }

    pub fn subscribe_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        if self.subscriptions.contains_key(&scene) {
            return Ok(());
        }
        let provider = *self
            .available
            .get(&scene)
            .ok_or(SceneCastError::SceneNotAvailable(scene))?;
        self.command(Command::Subscribe { scene, provider })?;
        self.subscriptions.insert(
            scene,
            SceneSubscription::with_limit(scene, provider, self.local, self.max_pending_flushes),
        );
        debug!(scene = %scene, provider = %provider, "subscribing");
        Ok(())
    }

    pub fn unsubscribe_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        let subscription = self
            .subscriptions
            .remove(&scene)
            .ok_or_else(|| SceneCastError::InvalidSceneState {
                scene,
                state: VisibilityState::Unsubscribed.to_string(),
            })?;
        self.monitor.stop_monitoring(scene);
        self.command(Command::Unsubscribe {
            scene,
            provider: subscription.provider,
        })
    }

    fn subscription_mut(&mut self, scene: SceneId) -> SceneCastResult<&mut SceneSubscription> {
        self.subscriptions
            .get_mut(&scene)
            .ok_or_else(|| SceneCastError::InvalidSceneState {
                scene,
                state: VisibilityState::Unsubscribed.to_string(),
            })
    }

    pub fn map_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.subscription_mut(scene)?.map()
    }

    pub fn unmap_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.subscription_mut(scene)?.unmap()
    }

    pub fn show_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.subscription_mut(scene)?.show()?;
        self.monitor.on_shown(scene);
        Ok(())
    }

    pub fn hide_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.subscription_mut(scene)?.hide()?;
        self.monitor.on_hidden(scene);
        Ok(())
    }

    pub fn scene_state(&self, scene: SceneId) -> VisibilityState {
        self.subscriptions
            .get(&scene)
            .map_or(VisibilityState::Unsubscribed, |s| s.visibility())
    }

    pub fn expiration_phase(&self, scene: SceneId) -> ExpirationPhase {
        self.monitor.phase(scene)
    }

    pub fn subscription(&self, scene: SceneId) -> Option<&SceneSubscription> {
        self.subscriptions.get(&scene)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Apply everything received so far; never blocks
    pub fn update(&mut self) {
        while let Some(item) = self.early.pop_front() {
            self.process(item);
        }
        loop {
            match self.inbound.try_recv() {
                Ok(item) => self.process(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Block until something arrives or `timeout` passes; nothing is applied
    pub fn wait_for_update(&mut self, timeout: Duration) -> bool {
        if !self.early.is_empty() {
            return true;
        }
        match self.inbound.recv_timeout(timeout) {
            Ok(item) => {
                self.early.push_back(item);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Every shown scene presented its latest applied state
    pub fn mark_rendered(&mut self) {
        for subscription in self.subscriptions.values().filter(|s| s.is_shown()) {
            self.monitor.on_rendered(subscription.scene);
        }
    }

    pub fn check_expiration(&mut self, now: FlushTime) {
        for event in self.monitor.check_expired(now) {
            match event {
                ExpirationEvent::Expired(scene) => {
                    self.stats.expirations += 1;
                    self.events.push_back(SceneEvent::SceneExpired(scene));
                }
                ExpirationEvent::Recovered(scene) => {
                    self.stats.recoveries += 1;
                    self.events.push_back(SceneEvent::SceneRecovered(scene));
                }
            }
        }
    }

    /// One host tick: update, render bookkeeping, expiration check
    pub fn do_one_loop(&mut self, now: FlushTime, mode: LoopMode) {
        self.update();
        if mode == LoopMode::UpdateAndRender {
            self.mark_rendered();
        }
        self.check_expiration(now);
    }

    pub fn dispatch_events<H: SceneEventHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let mut dispatched = 0;
        while let Some(event) = self.events.pop_front() {
            event.dispatch(handler);
            dispatched += 1;
        }
        dispatched
    }

    /// Take queued events without a handler
    pub fn take_events(&mut self) -> Vec<SceneEvent> {
        self.events.drain(..).collect()
    }

    fn drop_subscription(&mut self, scene: SceneId) {
        if self.subscriptions.remove(&scene).is_some() {
            self.monitor.stop_monitoring(scene);
        }
    }

    fn process(&mut self, item: Inbound) {
        match item {
            Inbound::Connected(peer) => self.events.push_back(SceneEvent::ParticipantConnected(peer)),
            Inbound::Lost(peer) => {
                let orphaned: Vec<SceneId> = self
                    .subscriptions
                    .values()
                    .filter(|s| s.provider == peer)
                    .map(|s| s.scene)
                    .collect();
                for scene in orphaned {
                    self.drop_subscription(scene);
                }
                self.available.retain(|_, provider| *provider != peer);
                self.resetting.remove(&peer);
                self.events.push_back(SceneEvent::ParticipantLost(peer));
            }
            Inbound::Published { scene, provider } => {
                self.available.insert(scene, provider);
                self.events
                    .push_back(SceneEvent::ScenePublished { scene, provider });
            }
            Inbound::Unpublished { scene, provider } => {
                if self.available.get(&scene) == Some(&provider) {
                    self.available.remove(&scene);
                }
                if self.subscriptions.get(&scene).map_or(false, |s| s.provider == provider) {
                    self.drop_subscription(scene);
                }
                self.events
                    .push_back(SceneEvent::SceneUnpublished { scene, provider });
            }
            Inbound::Accepted {
                scene,
                provider,
                next_sequence,
            } => {
                let Some(subscription) = self.subscriptions.get_mut(&scene) else {
                    return;
                };
                if subscription.provider != provider {
                    return;
                }
                let shown = subscription.is_shown();
                let ready = subscription.start_at(next_sequence);
                for flush in ready {
                    self.apply(flush, shown);
                }
            }
            Inbound::Unavailable { scene, provider } => {
                if self.subscriptions.get(&scene).map_or(false, |s| s.provider == provider) {
                    self.drop_subscription(scene);
                }
                self.events.push_back(SceneEvent::SceneUnavailable(scene));
            }
            Inbound::Flush { provider, flush } => self.receive_flush(provider, flush),
        }
    }

    fn receive_flush(&mut self, provider: ParticipantId, flush: Flush) {
        let scene = flush.scene;
        let Some(subscription) = self.subscriptions.get_mut(&scene) else {
            trace!(scene = %scene, "flush for unsubscribed scene dropped");
            return;
        };
        if subscription.provider != provider {
            debug!(scene = %scene, provider = %provider, "flush from foreign provider dropped");
            return;
        }
        let shown = subscription.is_shown();
        match subscription.offer(flush) {
            Ok(ready) => {
                for flush in ready {
                    self.apply(flush, shown);
                }
            }
            Err(err @ SceneCastError::ReorderOverflow { .. }) => {
                self.stats.flushes_discarded += 1;
                self.drop_subscription(scene);
                if !self.resetting.insert(provider) {
                    return;
                }
                warn!(scene = %scene, provider = %provider, error = %err, "provider stream lost, resetting connection");
                let reset = Command::ResetPeer {
                    peer: provider,
                    reason: err.to_string(),
                };
                if let Err(err) = self.command(reset) {
                    debug!(error = %err, "reset not delivered");
                }
            }
            Err(err) => {
                self.stats.flushes_discarded += 1;
                debug!(error = %err, "discarding flush");
            }
        }
    }

    fn apply(&mut self, flush: Flush, shown: bool) {
        self.monitor.on_flush_applied(flush.scene, flush.deadline);
        if shown && flush.is_empty() {
            self.monitor.on_rendered(flush.scene);
        }
        self.stats.flushes_applied += 1;
        self.events.push_back(SceneEvent::FlushApplied {
            scene: flush.scene,
            sequence: flush.sequence,
            name: flush.name,
            commands: flush.commands,
        });
    }
}

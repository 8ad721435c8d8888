//! Participant: one process's endpoint in the scene mesh

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use scenecast_core::{
    FlushTime, ParticipantAddress, ParticipantId, ParticipantIdentifier, SceneCastError,
    SceneCastResult, SceneEvent, SceneEventHandler, SceneId, SequenceNumber,
};
use scenecast_flush::{FlushSequencer, VisibilityState};
use scenecast_sched::{SchedulerConfig, TaskScheduler, WatchdogNotifier};
use scenecast_time::{Clock, ExpirationPhase, SystemClock};
use scenecast_transport::{
    LoopbackHub, LoopbackTransport, ParticipantRegistry, TcpTransport, Transport,
};
use scenecast_wire::{check_flush_size, Message};
use tracing::{debug, info};

use crate::config::{SessionConfig, TransportKind};
use crate::connection::{ConnectionInfo, ConnectionObserver, ConnectionState};
use crate::consumer::{ConsumerStats, LoopMode, SceneConsumer};
use crate::manager::{
    Command, ConnectionManager, ManagerConfig, ManagerEvent, ManagerHandler, ManagerSetup,
};

/// Time given to queued goodbyes before the transport closes
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

/// Optional collaborators for [`Participant`]
pub struct ParticipantBuilder {
    config: SessionConfig,
    hub: Option<LoopbackHub>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    watchdog: Option<Arc<dyn WatchdogNotifier>>,
}

impl ParticipantBuilder {
    /// Hub for `local_only` participants
    pub fn loopback_hub(mut self, hub: &LoopbackHub) -> Self {
        self.hub = Some(hub.clone());
        self
    }

    /// Clock used to stamp deadlines; the system clock by default
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn watchdog(mut self, watchdog: Arc<dyn WatchdogNotifier>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn start(self) -> SceneCastResult<Participant> {
        let config = self.config;
        config.validate()?;
        let kind = config.transport_kind()?;
        let id = config.participant_id();
        let name = config.participant_name.clone();
        let registry = Arc::new(ParticipantRegistry::new());

        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Network => {
                let tcp = config
                    .tcp
                    .as_ref()
                    .ok_or_else(|| SceneCastError::InvalidConfig("tcp settings missing".into()))?;
                Arc::new(TcpTransport::bind(id, name.clone(), tcp.socket_addr()?, registry.clone())?)
            }
            TransportKind::Loopback => {
                let hub = self.hub.as_ref().ok_or_else(|| {
                    SceneCastError::InvalidConfig("local_only participants need a loopback hub".into())
                })?;
                Arc::new(LoopbackTransport::new(hub, id, name.clone())?)
            }
        };
        let identifier = registry.register(transport.local_identifier().clone());

        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig {
                name: name.clone(),
                pool_size: config.worker_pool_size,
                watchdog_interval: config.watchdog_interval,
            },
            self.watchdog,
        ));
        let abort = |err: SceneCastError| {
            transport.shutdown();
            scheduler.shutdown();
            err
        };
        scheduler.start().map_err(abort)?;

        let (events_tx, events_rx) = mpsc::channel();
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let handler = Arc::new(ManagerHandler::new(events_tx.clone()));
        let links = handler.links();
        transport.start(handler).map_err(abort)?;

        let daemon = match &config.discovery {
            Some(discovery) => {
                let address = match kind {
                    TransportKind::Network => {
                        ParticipantAddress::Socket(discovery.socket_addr().map_err(abort)?)
                    }
                    TransportKind::Loopback => ParticipantAddress::Local,
                };
                let daemon = registry.register(ParticipantIdentifier::daemon(address));
                transport.connect(ParticipantId::DAEMON).map_err(|err| {
                    abort(SceneCastError::DiscoveryUnreachable {
                        address: address.to_string(),
                        reason: err.to_string(),
                    })
                })?;
                Some(daemon)
            }
            None => None,
        };

        let snapshot = Arc::new(RwLock::new(Vec::new()));
        let manager = ConnectionManager::new(ManagerSetup {
            local: identifier.clone(),
            config: ManagerConfig {
                keep_alive_interval: config.keep_alive_interval,
                keep_alive_timeout: config.keep_alive_timeout,
                protocol_version: config.protocol_version,
                max_queued_sends: config.max_queued_sends,
            },
            transport: transport.clone(),
            scheduler: scheduler.clone(),
            registry: registry.clone(),
            daemon,
            events: events_tx.clone(),
            inbound: inbound_tx,
            observers: self.observers,
            snapshot: snapshot.clone(),
            links,
        });
        let manager = thread::Builder::new()
            .name(format!("{}-connections", name))
            .spawn(move || manager.run(events_rx))
            .map_err(|err| abort(err.into()))?;

        info!(
            participant = %identifier,
            transport = ?kind,
            discovery = config.discovery.is_some(),
            keep_alive_interval = ?config.keep_alive_interval,
            keep_alive_timeout = ?config.keep_alive_timeout,
            workers = config.worker_pool_size,
            "participant started"
        );

        Ok(Participant {
            consumer: SceneConsumer::new(
                identifier.id,
                inbound_rx,
                events_tx.clone(),
                config.max_pending_flushes,
            ),
            identifier,
            config,
            transport,
            scheduler,
            sequencer: FlushSequencer::new(),
            clock: self.clock,
            commands: events_tx,
            manager: Some(manager),
            snapshot,
        })
    }
}

/// A producer and consumer of scenes
///
/// Producer calls may come from any thread. Consumer calls and ticks take
/// `&mut self` and belong to the hosting application's render thread.
pub struct Participant {
    identifier: Arc<ParticipantIdentifier>,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<TaskScheduler>,
    sequencer: FlushSequencer,
    clock: Arc<dyn Clock>,
    commands: Sender<ManagerEvent>,
    manager: Option<JoinHandle<()>>,
    snapshot: Arc<RwLock<Vec<ConnectionInfo>>>,
    consumer: SceneConsumer,
}

impl Participant {
    pub fn builder(config: SessionConfig) -> ParticipantBuilder {
        ParticipantBuilder {
            config,
            hub: None,
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
            watchdog: None,
        }
    }

    /// Start with defaults; `hub` is required for `local_only` configurations
    pub fn start(config: SessionConfig, hub: Option<&LoopbackHub>) -> SceneCastResult<Self> {
        let builder = Self::builder(config);
        match hub {
            Some(hub) => builder.loopback_hub(hub).start(),
            None => builder.start(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.identifier.id
    }

    pub fn identifier(&self) -> &ParticipantIdentifier {
        &self.identifier
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current time on this participant's clock, for stamping deadlines
    pub fn now(&self) -> FlushTime {
        self.clock.now()
    }

    fn command(&self, command: Command) -> SceneCastResult<()> {
        self.commands
            .send(ManagerEvent::Command(command))
            .map_err(|_| SceneCastError::SchedulerStopped)
    }

    // Connections

    /// Connect to a participant without going through discovery
    pub fn add_peer(&self, identifier: ParticipantIdentifier) -> SceneCastResult<()> {
        self.command(Command::AddPeer(identifier))
    }

    pub fn disconnect_peer(&self, peer: ParticipantId) -> SceneCastResult<()> {
        self.command(Command::Disconnect(peer))
    }

    /// Connections to other participants, ordered by peer id
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.snapshot
            .read()
            .iter()
            .filter(|info| !info.peer.is_daemon())
            .cloned()
            .collect()
    }

    pub fn is_connected_to(&self, peer: ParticipantId) -> bool {
        self.snapshot
            .read()
            .iter()
            .any(|info| info.peer == peer && info.state == ConnectionState::Established)
    }

    pub fn daemon_connected(&self) -> bool {
        self.is_connected_to(ParticipantId::DAEMON)
    }

    pub fn log_connection_info(&self) {
        let snapshot = self.snapshot.read();
        info!(participant = %self.identifier, connections = snapshot.len(), "connection table");
        for info in snapshot.iter() {
            info!(
                peer = %info.peer,
                name = %info.name,
                state = %info.state,
                since_last_sent = ?info.since_last_sent,
                since_last_received = ?info.since_last_received,
                "connection"
            );
        }
    }

    pub fn failed_tasks(&self) -> u64 {
        self.scheduler.failed_tasks()
    }

    // Producer

    /// Make `scene` available; returns the sequence number of its next flush
    pub fn publish_scene(&self, scene: SceneId) -> SceneCastResult<SequenceNumber> {
        self.sequencer.register_scene(scene, |next_sequence| {
            self.command(Command::Publish {
                scene,
                next_sequence,
            })
        })
    }

    pub fn unpublish_scene(&self, scene: SceneId) -> SceneCastResult<()> {
        self.sequencer
            .unregister_scene(scene, || self.command(Command::Unpublish(scene)))
    }

    pub fn is_published(&self, scene: SceneId) -> bool {
        self.sequencer.is_published(scene)
    }

    /// Send the next state change of `scene` to its subscribers
    ///
    /// A flush that would not fit in one message is refused with
    /// [`SceneCastError::MessageTooLarge`] and consumes no sequence number.
    pub fn create_flush(
        &self,
        scene: SceneId,
        commands: impl Into<Bytes>,
        name: Option<&str>,
        deadline: Option<FlushTime>,
    ) -> SceneCastResult<SequenceNumber> {
        let commands = commands.into();
        check_flush_size(name, commands.len())?;
        let sequence = self.sequencer.create_flush(
            scene,
            commands,
            name.map(str::to_owned),
            deadline,
            |flush| {
                let scene = flush.scene;
                let sequence = flush.sequence;
                let payload = Message::Flush(flush).encode()?;
                self.command(Command::Flush {
                    scene,
                    sequence,
                    payload,
                })
            },
        )?;
        debug!(scene = %scene, sequence = %sequence, "flush created");
        Ok(sequence)
    }

    // Consumer

    pub fn available_scenes(&self) -> Vec<(SceneId, ParticipantId)> {
        self.consumer.available_scenes()
    }

    pub fn subscribe_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.consumer.subscribe_scene(scene)
    }

    pub fn unsubscribe_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.consumer.unsubscribe_scene(scene)
    }

    pub fn map_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.consumer.map_scene(scene)
    }

    pub fn show_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.consumer.show_scene(scene)
    }

    pub fn hide_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.consumer.hide_scene(scene)
    }

    pub fn unmap_scene(&mut self, scene: SceneId) -> SceneCastResult<()> {
        self.consumer.unmap_scene(scene)
    }

    pub fn scene_state(&self, scene: SceneId) -> VisibilityState {
        self.consumer.scene_state(scene)
    }

    pub fn expiration_phase(&self, scene: SceneId) -> ExpirationPhase {
        self.consumer.expiration_phase(scene)
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    // Tick

    pub fn update(&mut self) {
        self.consumer.update();
    }

    pub fn mark_rendered(&mut self) {
        self.consumer.mark_rendered();
    }

    pub fn check_expiration(&mut self, now: FlushTime) {
        self.consumer.check_expiration(now);
    }

    pub fn do_one_loop(&mut self, now: FlushTime, mode: LoopMode) {
        self.consumer.do_one_loop(now, mode);
    }

    /// Block until an update arrives, at most `max_frame_callback_polling_time`
    pub fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let timeout = timeout.min(self.config.max_frame_callback_polling_time);
        self.consumer.wait_for_update(timeout)
    }

    pub fn dispatch_events<H: SceneEventHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        self.consumer.dispatch_events(handler)
    }

    pub fn take_events(&mut self) -> Vec<SceneEvent> {
        self.consumer.take_events()
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_some()
    }

    /// Say goodbye, stop the manager, the transport and the workers
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        let _ = self.commands.send(ManagerEvent::Command(Command::Shutdown));
        let _ = manager.join();
        if !self.scheduler.drain(SHUTDOWN_DRAIN) {
            debug!(participant = %self.identifier.id, "shutdown drain timed out");
        }
        self.transport.shutdown();
        self.scheduler.shutdown();
        info!(participant = %self.identifier, "participant stopped");
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.shutdown();
    }
}

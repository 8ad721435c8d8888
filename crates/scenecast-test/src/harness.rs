//! In-process participant meshes
//!
//! A [`Mesh`] runs N participants on one [`LoopbackHub`], optionally behind
//! a discovery daemon, all stamping and checking deadlines against one
//! shared [`ManualClock`]. Participant `i` (zero based) has id `i + 1`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scenecast_core::{FlushTime, ParticipantId, SceneCastError, SceneCastResult, SceneId, SequenceNumber};
use scenecast_runtime::{
    DiscoveryConfig, DiscoveryDaemon, LoopMode, Participant, SessionConfig, DEFAULT_DISCOVERY_PORT,
};
use scenecast_time::{Clock, ManualClock};
use scenecast_transport::LoopbackHub;
use tracing::debug;

use crate::RecordingHandler;

/// Default bound for every wait in the harness
pub const WAIT: Duration = Duration::from_secs(5);

/// Arbitrary but realistic epoch for the shared clock
pub const EPOCH: FlushTime = FlushTime(1_700_000_000_000);

/// How participants find each other
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshTopology {
    /// Every participant is told about every other one
    Direct,
    /// Participants announce themselves to a loopback daemon
    Discovery,
}

/// Mesh configuration
#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub participants: usize,
    pub topology: MeshTopology,
    pub session: SessionConfig,
}

impl MeshConfig {
    pub fn direct(participants: usize) -> Self {
        MeshConfig {
            participants,
            topology: MeshTopology::Direct,
            session: SessionConfig::local_testing(),
        }
    }

    pub fn discovery(participants: usize) -> Self {
        MeshConfig {
            participants,
            topology: MeshTopology::Discovery,
            session: SessionConfig::local_testing(),
        }
    }
}

/// A running mesh of loopback participants
pub struct Mesh {
    pub hub: LoopbackHub,
    pub clock: Arc<ManualClock>,
    pub daemon: Option<DiscoveryDaemon>,
    participants: Vec<Participant>,
    recorders: Vec<RecordingHandler>,
}

impl Mesh {
    pub fn start(config: MeshConfig) -> SceneCastResult<Self> {
        let hub = LoopbackHub::new();
        let clock = Arc::new(ManualClock::new(EPOCH));

        let daemon = match config.topology {
            MeshTopology::Discovery => Some(DiscoveryDaemon::start_loopback(&config.session, &hub)?),
            MeshTopology::Direct => None,
        };

        let mut participants = Vec::with_capacity(config.participants);
        for index in 0..config.participants {
            let id = index as u64 + 1;
            let mut session = config
                .session
                .clone()
                .with_name(format!("participant-{}", id))
                .with_id(id);
            if config.topology == MeshTopology::Discovery {
                session = session.with_discovery(DiscoveryConfig::new("127.0.0.1", DEFAULT_DISCOVERY_PORT));
            }
            let participant = Participant::builder(session)
                .loopback_hub(&hub)
                .clock(clock.clone())
                .start()?;
            participants.push(participant);
        }

        if config.topology == MeshTopology::Direct {
            for a in 0..participants.len() {
                for b in (a + 1)..participants.len() {
                    let identifier = participants[b].identifier().clone();
                    participants[a].add_peer(identifier)?;
                }
            }
        }

        let recorders = participants.iter().map(|_| RecordingHandler::new()).collect();
        debug!(participants = config.participants, topology = ?config.topology, "mesh started");
        Ok(Mesh {
            hub,
            clock,
            daemon,
            participants,
            recorders,
        })
    }

    /// Direct mesh that is already fully connected
    pub fn connected(participants: usize) -> SceneCastResult<Self> {
        let mesh = Self::start(MeshConfig::direct(participants))?;
        if !mesh.wait_fully_connected(WAIT) {
            return Err(SceneCastError::InvalidConfig("mesh did not connect".into()));
        }
        Ok(mesh)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn id(&self, index: usize) -> ParticipantId {
        self.participants[index].id()
    }

    pub fn participant(&mut self, index: usize) -> &mut Participant {
        &mut self.participants[index]
    }

    pub fn recorder(&self, index: usize) -> &RecordingHandler {
        &self.recorders[index]
    }

    pub fn recorder_mut(&mut self, index: usize) -> &mut RecordingHandler {
        &mut self.recorders[index]
    }

    pub fn now(&self) -> FlushTime {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) -> FlushTime {
        self.clock.advance(by)
    }

    /// Every pair of running participants sees each other as established
    pub fn wait_fully_connected(&self, timeout: Duration) -> bool {
        wait_until(timeout, || {
            self.participants.iter().all(|p| {
                self.participants
                    .iter()
                    .filter(|other| other.id() != p.id() && other.is_running())
                    .all(|other| p.is_connected_to(other.id()))
            })
        })
    }

    /// Drain `index`'s pending updates into its recorder without checking expiration
    pub fn update(&mut self, index: usize) -> usize {
        let participant = &mut self.participants[index];
        participant.update();
        participant.dispatch_events(&mut self.recorders[index])
    }

    /// One host loop on `index` at the shared clock's time
    pub fn tick(&mut self, index: usize, mode: LoopMode) -> usize {
        let now = self.now();
        let participant = &mut self.participants[index];
        participant.do_one_loop(now, mode);
        participant.dispatch_events(&mut self.recorders[index])
    }

    /// Update `index` until `done` holds over its recorder
    pub fn pump_until(
        &mut self,
        index: usize,
        timeout: Duration,
        mut done: impl FnMut(&RecordingHandler) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let participant = &mut self.participants[index];
            participant.wait_for_update(Duration::from_millis(10));
            participant.update();
            participant.dispatch_events(&mut self.recorders[index]);
            if done(&self.recorders[index]) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Publish `scene` on `provider` and subscribe `consumer` to it
    ///
    /// Returns once the subscription handshake has completed, proven by a
    /// primer flush with `deadline` being applied on the consumer.
    pub fn share_scene(
        &mut self,
        provider: usize,
        consumer: usize,
        scene: SceneId,
        deadline: Option<FlushTime>,
    ) -> SceneCastResult<SequenceNumber> {
        if !self.participants[provider].is_published(scene) {
            self.participants[provider].publish_scene(scene)?;
        }
        if !self.pump_until(consumer, WAIT, |r| r.published(scene)) {
            return Err(SceneCastError::SceneNotAvailable(scene));
        }
        self.participants[consumer].subscribe_scene(scene)?;

        let started = Instant::now();
        while started.elapsed() < WAIT {
            let sequence = self.participants[provider].create_flush(scene, Vec::<u8>::new(), Some("primer"), deadline)?;
            if self.pump_until(consumer, Duration::from_millis(50), |r| r.has_applied(scene, sequence)) {
                return Ok(sequence);
            }
        }
        Err(SceneCastError::SceneNotAvailable(scene))
    }

    /// Create a flush on `provider` and wait until `consumer` applied it
    pub fn deliver(
        &mut self,
        provider: usize,
        consumer: usize,
        scene: SceneId,
        commands: &[u8],
        deadline: Option<FlushTime>,
    ) -> SceneCastResult<SequenceNumber> {
        let sequence = self.participants[provider].create_flush(scene, commands.to_vec(), None, deadline)?;
        if !self.pump_until(consumer, WAIT, |r| r.has_applied(scene, sequence)) {
            return Err(SceneCastError::InvalidSceneState {
                scene,
                state: format!("flush {} never applied", sequence),
            });
        }
        Ok(sequence)
    }

    /// Shut down one participant, leaving the rest running
    pub fn stop(&mut self, index: usize) {
        self.participants[index].shutdown();
    }

    pub fn shutdown(&mut self) {
        for participant in self.participants.iter_mut() {
            participant.shutdown();
        }
        if let Some(daemon) = self.daemon.as_mut() {
            daemon.shutdown();
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

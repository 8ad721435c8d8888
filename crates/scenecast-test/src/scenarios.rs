//! End-to-end session scenarios on loopback meshes
//!
//! Deadlines are stamped and checked against the mesh's manual clock, so
//! expiration outcomes do not depend on scheduling jitter.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use scenecast_core::{
    Flush, ParticipantAddress, ParticipantId, ParticipantIdentifier, SceneCastError, SceneEvent, SceneId,
    SequenceNumber, PROTOCOL_VERSION,
};
use scenecast_flush::VisibilityState;
use scenecast_runtime::{LoopMode, Participant, SessionConfig};
use scenecast_time::ExpirationPhase;
use scenecast_transport::{LoopbackHub, LoopbackTransport, Transport, TransportHandler};
use scenecast_wire::{Message, MAX_MESSAGE_SIZE};

use crate::{wait_until, Mesh, MeshConfig, RecordingHandler, WAIT};

const HOUR: Duration = Duration::from_secs(3600);
const PROVIDER: usize = 0;
const CONSUMER: usize = 1;

#[test]
fn test_future_deadlines_never_expire() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(1);
    let deadline = mesh.now() + HOUR;
    mesh.share_scene(PROVIDER, CONSUMER, scene, Some(deadline)).unwrap();

    for _ in 0..5 {
        let deadline = mesh.now() + HOUR;
        mesh.deliver(PROVIDER, CONSUMER, scene, b"tick", Some(deadline)).unwrap();
        mesh.advance(Duration::from_millis(16));
        mesh.tick(CONSUMER, LoopMode::UpdateAndRender);
    }

    assert_eq!(mesh.recorder(CONSUMER).expirations(scene), 0);
    assert_eq!(mesh.participant(CONSUMER).expiration_phase(scene), ExpirationPhase::OnTime);
    assert_eq!(mesh.participant(CONSUMER).scene_state(scene), VisibilityState::Subscribed);
}

#[test]
fn test_past_deadline_expires_exactly_once() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(1);
    let deadline = mesh.now() + HOUR;
    mesh.share_scene(PROVIDER, CONSUMER, scene, Some(deadline)).unwrap();
    mesh.tick(CONSUMER, LoopMode::UpdateAndRender);

    let past = mesh.now() - HOUR;
    mesh.deliver(PROVIDER, CONSUMER, scene, b"late", Some(past)).unwrap();
    for _ in 0..5 {
        mesh.advance(Duration::from_millis(16));
        mesh.tick(CONSUMER, LoopMode::UpdateAndRender);
    }

    assert_eq!(mesh.recorder(CONSUMER).expirations(scene), 1);
    assert_eq!(mesh.recorder(CONSUMER).recoveries(scene), 0);
    assert_eq!(mesh.participant(CONSUMER).expiration_phase(scene), ExpirationPhase::Expired);
    assert_eq!(mesh.participant(CONSUMER).consumer_stats().expirations, 1);
}

#[test]
fn test_shown_scene_expires_without_render_and_recovers_after_hide() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(7);
    let window = Duration::from_millis(300);
    let deadline = mesh.now() + window;
    mesh.share_scene(PROVIDER, CONSUMER, scene, Some(deadline)).unwrap();
    mesh.participant(CONSUMER).map_scene(scene).unwrap();
    mesh.participant(CONSUMER).show_scene(scene).unwrap();

    let deadline = mesh.now() + window;
    mesh.deliver(PROVIDER, CONSUMER, scene, b"frame", Some(deadline)).unwrap();
    mesh.tick(CONSUMER, LoopMode::UpdateAndRender);
    assert_eq!(mesh.recorder(CONSUMER).expirations(scene), 0);

    // Content keeps arriving with fresh deadlines but is never rendered.
    for _ in 0..4 {
        mesh.advance(Duration::from_millis(100));
        let deadline = mesh.now() + window;
        mesh.deliver(PROVIDER, CONSUMER, scene, b"frame", Some(deadline)).unwrap();
        mesh.tick(CONSUMER, LoopMode::UpdateOnly);
    }
    assert_eq!(mesh.recorder(CONSUMER).expirations(scene), 1);
    assert_eq!(mesh.recorder(CONSUMER).recoveries(scene), 0);

    mesh.participant(CONSUMER).hide_scene(scene).unwrap();
    for _ in 0..3 {
        let deadline = mesh.now() + window;
        mesh.deliver(PROVIDER, CONSUMER, scene, b"frame", Some(deadline)).unwrap();
        mesh.tick(CONSUMER, LoopMode::UpdateOnly);
        mesh.advance(Duration::from_millis(10));
    }

    let recorder = mesh.recorder(CONSUMER);
    assert_eq!(recorder.expirations(scene), 1);
    assert_eq!(recorder.recoveries(scene), 1);
    assert_eq!(mesh.participant(CONSUMER).expiration_phase(scene), ExpirationPhase::OnTime);
    assert_eq!(mesh.participant(CONSUMER).scene_state(scene), VisibilityState::Mapped);
}

#[test]
fn test_expiration_is_tracked_per_scene() {
    let mut mesh = Mesh::connected(2).unwrap();
    let late = SceneId::new(1);
    let current = SceneId::new(2);
    let deadline = mesh.now() + HOUR;
    mesh.share_scene(PROVIDER, CONSUMER, late, Some(deadline)).unwrap();
    mesh.share_scene(PROVIDER, CONSUMER, current, Some(deadline)).unwrap();

    let short = mesh.now() + Duration::from_millis(100);
    mesh.deliver(PROVIDER, CONSUMER, late, b"a", Some(short)).unwrap();
    let long = mesh.now() + HOUR;
    mesh.deliver(PROVIDER, CONSUMER, current, b"b", Some(long)).unwrap();
    mesh.advance(Duration::from_millis(200));
    mesh.tick(CONSUMER, LoopMode::UpdateAndRender);

    assert_eq!(mesh.recorder(CONSUMER).expirations(late), 1);
    assert_eq!(mesh.recorder(CONSUMER).expirations(current), 0);

    let fresh = mesh.now() + HOUR;
    mesh.deliver(PROVIDER, CONSUMER, late, b"a", Some(fresh)).unwrap();
    mesh.tick(CONSUMER, LoopMode::UpdateAndRender);

    let recorder = mesh.recorder(CONSUMER);
    assert_eq!(recorder.recoveries(late), 1);
    assert_eq!(recorder.recoveries(current), 0);
    assert_eq!(recorder.expiration_scenes(), vec![late]);
}

#[test]
fn test_missing_deadline_disables_expiration() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(3);
    let past = mesh.now() - HOUR;
    mesh.share_scene(PROVIDER, CONSUMER, scene, Some(past)).unwrap();
    mesh.deliver(PROVIDER, CONSUMER, scene, b"timeless", None).unwrap();

    mesh.advance(HOUR);
    mesh.tick(CONSUMER, LoopMode::UpdateAndRender);

    assert_eq!(mesh.recorder(CONSUMER).expirations(scene), 0);
    assert_eq!(mesh.participant(CONSUMER).expiration_phase(scene), ExpirationPhase::NotMonitored);
}

#[test]
fn test_applied_sequence_is_strictly_increasing() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(11);
    let primer = mesh.share_scene(PROVIDER, CONSUMER, scene, None).unwrap();

    let mut last = SequenceNumber::FIRST;
    for i in 0u8..50 {
        last = mesh.participant(PROVIDER).create_flush(scene, vec![i], None, None).unwrap();
    }
    assert!(mesh.pump_until(CONSUMER, WAIT, |r| r.has_applied(scene, last)));

    let applied = mesh.recorder(CONSUMER).applied(scene);
    assert!(applied.contains(&primer.value()));
    assert_eq!(applied.last(), Some(&last.value()));
    for pair in applied.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

#[test]
fn test_oversized_flush_leaves_stream_intact() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(12);
    let primer = mesh.share_scene(PROVIDER, CONSUMER, scene, None).unwrap();

    let long_name = "x".repeat(70_000);
    assert!(matches!(
        mesh.participant(PROVIDER).create_flush(scene, b"named".to_vec(), Some(&long_name), None),
        Err(SceneCastError::MessageTooLarge(_))
    ));
    assert!(matches!(
        mesh.participant(PROVIDER).create_flush(scene, vec![0u8; MAX_MESSAGE_SIZE], None, None),
        Err(SceneCastError::MessageTooLarge(_))
    ));

    let next = mesh.deliver(PROVIDER, CONSUMER, scene, b"after", None).unwrap();
    assert_eq!(next, primer.next());
    let applied = mesh.recorder(CONSUMER).applied(scene);
    assert_eq!(applied.last(), Some(&next.value()));
    for pair in applied.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    let consumer_id = mesh.id(CONSUMER);
    assert!(mesh.participant(PROVIDER).is_connected_to(consumer_id));
    assert_eq!(mesh.recorder(CONSUMER).lost(mesh.id(PROVIDER)), 0);
}

#[test]
fn test_flushes_reach_every_subscriber() {
    let mut mesh = Mesh::connected(3).unwrap();
    let scene = SceneId::new(4);
    mesh.share_scene(PROVIDER, 1, scene, None).unwrap();
    mesh.share_scene(PROVIDER, 2, scene, None).unwrap();

    let sequence = mesh.participant(PROVIDER).create_flush(scene, b"both".to_vec(), Some("shared"), None).unwrap();
    assert!(mesh.pump_until(1, WAIT, |r| r.has_applied(scene, sequence)));
    assert!(mesh.pump_until(2, WAIT, |r| r.has_applied(scene, sequence)));
}

#[test]
fn test_unpublish_ends_subscription() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(8);
    mesh.share_scene(PROVIDER, CONSUMER, scene, None).unwrap();

    mesh.participant(PROVIDER).unpublish_scene(scene).unwrap();
    assert!(mesh.pump_until(CONSUMER, WAIT, |r| r.unpublished(scene)));
    assert_eq!(mesh.participant(CONSUMER).scene_state(scene), VisibilityState::Unsubscribed);
    assert!(mesh.participant(CONSUMER).available_scenes().is_empty());
}

#[test]
fn test_keep_alive_timeout_tears_down_once() {
    let mut mesh = Mesh::connected(2).unwrap();
    let scene = SceneId::new(9);
    mesh.share_scene(PROVIDER, CONSUMER, scene, None).unwrap();
    let provider = mesh.id(PROVIDER);
    let consumer = mesh.id(CONSUMER);

    mesh.hub.partition(provider, consumer);
    assert!(mesh.pump_until(CONSUMER, WAIT, |r| r.lost(provider) > 0));
    assert!(mesh.pump_until(PROVIDER, WAIT, |r| r.lost(consumer) > 0));

    let before = mesh.recorder(CONSUMER).applied(scene).len();
    assert!(mesh.participant(PROVIDER).create_flush(scene, b"gone".to_vec(), None, None).is_ok());
    mesh.pump_until(CONSUMER, Duration::from_millis(200), |_| false);

    let recorder = mesh.recorder(CONSUMER);
    assert_eq!(recorder.lost(provider), 1);
    assert_eq!(recorder.applied(scene).len(), before);
    assert_eq!(mesh.participant(CONSUMER).scene_state(scene), VisibilityState::Unsubscribed);
    let consumer = mesh.participant(CONSUMER);
    assert!(wait_until(WAIT, || !consumer.is_connected_to(provider)));
}

#[test]
fn test_departure_is_reported_once() {
    let mut mesh = Mesh::connected(2).unwrap();
    let provider = mesh.id(PROVIDER);
    mesh.stop(PROVIDER);

    assert!(mesh.pump_until(CONSUMER, WAIT, |r| r.lost(provider) > 0));
    mesh.pump_until(CONSUMER, Duration::from_millis(100), |_| false);
    assert_eq!(mesh.recorder(CONSUMER).lost(provider), 1);
}

#[test]
fn test_discovery_mesh_connects_all_participants() {
    let mut mesh = Mesh::start(MeshConfig::discovery(3)).unwrap();
    assert!(mesh.wait_fully_connected(WAIT));
    for index in 0..mesh.len() {
        let participant = mesh.participant(index);
        assert!(wait_until(WAIT, || participant.daemon_connected()));
        assert_eq!(participant.connections().len(), 2);
    }
    let roster: Vec<ParticipantId> = mesh
        .daemon
        .as_ref()
        .map(|daemon| daemon.participants().iter().map(|p| p.id).collect())
        .unwrap_or_default();
    assert_eq!(roster, vec![mesh.id(0), mesh.id(1), mesh.id(2)]);

    let scene = SceneId::new(21);
    mesh.share_scene(2, 0, scene, None).unwrap();
    mesh.deliver(2, 0, scene, b"via discovery", None).unwrap();

    mesh.stop(2);
    let departed = mesh.id(2);
    assert!(mesh.pump_until(0, WAIT, |r| r.lost(departed) > 0));
    assert!(wait_until(WAIT, || {
        mesh.daemon
            .as_ref()
            .map_or(false, |daemon| daemon.participants().len() == 2)
    }));
}

struct ScriptedHandler {
    messages: Sender<Message>,
}

impl TransportHandler for ScriptedHandler {
    fn on_receive(&self, _peer: ParticipantId, payload: Bytes) {
        if let Ok(message) = Message::decode(&payload) {
            let _ = self.messages.send(message);
        }
    }

    fn on_disconnected(&self, _peer: ParticipantId) {}
}

/// Provider driven message by message from the test
struct ScriptedProvider {
    transport: LoopbackTransport,
    messages: Receiver<Message>,
}

impl ScriptedProvider {
    fn new(hub: &LoopbackHub, id: u64) -> Self {
        let transport = LoopbackTransport::new(hub, ParticipantId::new(id), "scripted").unwrap();
        let (tx, messages) = mpsc::channel();
        transport.start(Arc::new(ScriptedHandler { messages: tx })).unwrap();
        ScriptedProvider { transport, messages }
    }

    fn identifier(&self) -> ParticipantIdentifier {
        ParticipantIdentifier::new(self.transport.local_identifier().id, "scripted", ParticipantAddress::Local)
    }

    fn send(&self, to: ParticipantId, message: Message) {
        self.transport.connect(to).unwrap();
        self.transport.send(to, &message.encode().unwrap()).unwrap();
    }

    fn expect(&self, wanted: impl Fn(&Message) -> bool) -> Message {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.messages.recv_timeout(left) {
                Ok(message) if wanted(&message) => return message,
                Ok(_) => continue,
                Err(err) => panic!("scripted provider gave up waiting: {}", err),
            }
        }
    }

    fn flush(&self, to: ParticipantId, scene: SceneId, sequence: u64) {
        let flush = Flush::new(scene, SequenceNumber::new(sequence), vec![sequence as u8]);
        self.send(to, Message::Flush(flush));
    }
}

fn pump(
    participant: &mut Participant,
    recorder: &mut RecordingHandler,
    timeout: Duration,
    done: impl Fn(&RecordingHandler) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        participant.wait_for_update(Duration::from_millis(10));
        participant.update();
        participant.dispatch_events(recorder);
        if done(recorder) {
            return true;
        }
    }
    false
}

#[test]
fn test_duplicate_and_reordered_flushes_apply_once_in_order() {
    let hub = LoopbackHub::new();
    let mut session = SessionConfig::local_testing().with_name("consumer").with_id(1);
    session.keep_alive_timeout = Duration::from_secs(10);
    let mut consumer = Participant::start(session, Some(&hub)).unwrap();
    let provider = ScriptedProvider::new(&hub, 100);
    let provider_id = provider.identifier().id;
    let mut recorder = RecordingHandler::new();

    consumer.add_peer(provider.identifier()).unwrap();
    provider.expect(|m| matches!(m, Message::Hello { .. }));
    provider.send(
        consumer.id(),
        Message::Hello {
            identifier: provider.identifier(),
            protocol_version: PROTOCOL_VERSION,
        },
    );
    assert!(pump(&mut consumer, &mut recorder, WAIT, |r| r.connected(provider_id) == 1));

    let scene = SceneId::new(5);
    provider.send(consumer.id(), Message::PublishScene(scene));
    assert!(pump(&mut consumer, &mut recorder, WAIT, |r| r.published(scene)));
    consumer.subscribe_scene(scene).unwrap();
    provider.expect(|m| *m == Message::SubscribeScene(scene));

    // Arrivals before acceptance are held back.
    provider.flush(consumer.id(), scene, 2);
    provider.send(
        consumer.id(),
        Message::SubscriptionAccepted {
            scene,
            next_sequence: SequenceNumber::new(1),
        },
    );
    provider.flush(consumer.id(), scene, 1);
    provider.flush(consumer.id(), scene, 2);
    provider.flush(consumer.id(), scene, 4);
    provider.flush(consumer.id(), scene, 3);
    provider.flush(consumer.id(), scene, 1);
    assert!(pump(&mut consumer, &mut recorder, WAIT, |r| r.applied(scene).len() >= 4));
    pump(&mut consumer, &mut recorder, Duration::from_millis(100), |_| false);

    assert_eq!(recorder.applied(scene), vec![1, 2, 3, 4]);
    let stats = consumer.consumer_stats();
    assert_eq!(stats.flushes_applied, 4);
    assert_eq!(stats.flushes_discarded, 2);
    assert!(recorder
        .events()
        .iter()
        .all(|e| !matches!(e, SceneEvent::ParticipantLost(_))));
}

#[test]
fn test_reorder_overflow_drops_provider_connection() {
    let hub = LoopbackHub::new();
    let mut session = SessionConfig::local_testing().with_name("consumer").with_id(1);
    session.keep_alive_timeout = Duration::from_secs(10);
    session.max_pending_flushes = 2;
    let mut consumer = Participant::start(session, Some(&hub)).unwrap();
    let provider = ScriptedProvider::new(&hub, 100);
    let provider_id = provider.identifier().id;
    let mut recorder = RecordingHandler::new();

    consumer.add_peer(provider.identifier()).unwrap();
    provider.expect(|m| matches!(m, Message::Hello { .. }));
    provider.send(
        consumer.id(),
        Message::Hello {
            identifier: provider.identifier(),
            protocol_version: PROTOCOL_VERSION,
        },
    );
    assert!(pump(&mut consumer, &mut recorder, WAIT, |r| r.connected(provider_id) == 1));

    let scene = SceneId::new(6);
    provider.send(consumer.id(), Message::PublishScene(scene));
    assert!(pump(&mut consumer, &mut recorder, WAIT, |r| r.published(scene)));
    consumer.subscribe_scene(scene).unwrap();
    provider.expect(|m| *m == Message::SubscribeScene(scene));
    provider.send(
        consumer.id(),
        Message::SubscriptionAccepted {
            scene,
            next_sequence: SequenceNumber::new(1),
        },
    );

    // sequence 1 never arrives
    for sequence in 2..=4 {
        provider.flush(consumer.id(), scene, sequence);
    }
    assert!(pump(&mut consumer, &mut recorder, WAIT, |r| r.lost(provider_id) > 0));
    assert_eq!(recorder.lost(provider_id), 1);
    assert!(recorder.applied(scene).is_empty());
    assert_eq!(consumer.scene_state(scene), VisibilityState::Unsubscribed);
}

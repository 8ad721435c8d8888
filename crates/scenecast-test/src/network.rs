//! Sessions over real TCP sockets on the loopback interface

use std::time::{Duration, Instant};

use scenecast_core::{SceneEvent, SceneId};
use scenecast_runtime::{DiscoveryConfig, DiscoveryDaemon, Participant, SessionConfig};
use serial_test::serial;

use crate::{wait_until, RecordingHandler, WAIT};

fn pump(participant: &mut Participant, recorder: &mut RecordingHandler, done: impl Fn(&RecordingHandler) -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
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

fn tcp_participant(id: u64, discovery_port: u16) -> Participant {
    let config = SessionConfig::default()
        .with_name(format!("tcp-{}", id))
        .with_id(id)
        .with_discovery(DiscoveryConfig::new("127.0.0.1", discovery_port));
    Participant::start(config, None).unwrap()
}

#[test]
#[serial]
fn test_tcp_session_through_discovery() {
    let mut daemon = DiscoveryDaemon::bind_tcp(&SessionConfig::default(), "127.0.0.1:0".parse().unwrap()).unwrap();
    let port = daemon.local_addr().unwrap().port();

    let mut provider = tcp_participant(1, port);
    let mut consumer = tcp_participant(2, port);
    assert!(wait_until(WAIT, || {
        provider.is_connected_to(consumer.id()) && consumer.is_connected_to(provider.id())
    }));
    assert!(provider.daemon_connected());
    assert!(consumer.daemon_connected());
    assert_eq!(daemon.participants().len(), 2);

    let scene = SceneId::new(77);
    let mut recorder = RecordingHandler::new();
    provider.publish_scene(scene).unwrap();
    assert!(pump(&mut consumer, &mut recorder, |r| r.published(scene)));
    consumer.subscribe_scene(scene).unwrap();

    let started = Instant::now();
    let mut last = None;
    while started.elapsed() < WAIT && recorder.applied(scene).len() < 10 {
        last = Some(provider.create_flush(scene, b"over tcp".to_vec(), Some("tcp"), None).unwrap());
        consumer.wait_for_update(Duration::from_millis(10));
        consumer.update();
        consumer.dispatch_events(&mut recorder);
    }
    let applied = recorder.applied(scene);
    assert!(applied.len() >= 10);
    assert!(last.map_or(false, |last| applied.last().copied() <= Some(last.value())));
    for pair in applied.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }

    provider.shutdown();
    assert!(pump(&mut consumer, &mut recorder, |r| r.lost(provider.id()) > 0));
    assert_eq!(
        recorder
            .events()
            .iter()
            .filter(|e| **e == SceneEvent::ParticipantLost(provider.id()))
            .count(),
        1
    );

    consumer.shutdown();
    daemon.shutdown();
    assert!(!daemon.is_running());
}

#[test]
#[serial]
fn test_tcp_daemon_loss_keeps_direct_connections() {
    let mut daemon = DiscoveryDaemon::bind_tcp(&SessionConfig::default(), "127.0.0.1:0".parse().unwrap()).unwrap();
    let port = daemon.local_addr().unwrap().port();

    let a = tcp_participant(1, port);
    let b = tcp_participant(2, port);
    assert!(wait_until(WAIT, || a.is_connected_to(b.id()) && b.is_connected_to(a.id())));

    daemon.shutdown();
    assert!(wait_until(WAIT, || !a.daemon_connected() && !b.daemon_connected()));
    assert!(a.is_connected_to(b.id()));
    assert!(b.is_connected_to(a.id()));
}

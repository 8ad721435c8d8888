//! Ordered per-peer send queue drained on the worker pool

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use scenecast_core::{ParticipantId, SceneCastError, SceneCastResult};
use scenecast_sched::TaskScheduler;
use scenecast_transport::Transport;
use tracing::{trace, warn};

/// Called when a send to the outbox's peer fails or the queue overflows
pub type SendFailure = Arc<dyn Fn(ParticipantId, SceneCastError) + Send + Sync>;

/// Default bound on payloads queued for one peer
pub const DEFAULT_MAX_QUEUED_SENDS: usize = 8192;

#[derive(Default)]
struct OutboxState {
    queue: VecDeque<Bytes>,
    draining: bool,
    closed: bool,
}

/// FIFO of encoded messages for one peer
///
/// At most one drain task per outbox is in flight on the pool, so payloads
/// leave in push order even though several workers run concurrently. A peer
/// that lets more than `max_queued` payloads pile up is reported through
/// the failure callback like a broken link.
pub struct PeerOutbox {
    peer: ParticipantId,
    max_queued: usize,
    state: Mutex<OutboxState>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<TaskScheduler>,
    on_failure: SendFailure,
}

impl PeerOutbox {
    pub fn new(
        peer: ParticipantId,
        transport: Arc<dyn Transport>,
        scheduler: Arc<TaskScheduler>,
        max_queued: usize,
        on_failure: SendFailure,
    ) -> Arc<Self> {
        Arc::new(PeerOutbox {
            peer,
            max_queued: max_queued.max(1),
            state: Mutex::new(OutboxState::default()),
            transport,
            scheduler,
            on_failure,
        })
    }

    pub fn peer(&self) -> ParticipantId {
        self.peer
    }

    /// Queue a payload; schedules a drain task when none is running
    pub fn push(self: &Arc<Self>, payload: Bytes) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.queue.len() >= self.max_queued {
                state.closed = true;
                state.queue.clear();
                drop(state);
                warn!(peer = %self.peer, limit = self.max_queued, "send queue overflow, outbox closed");
                (self.on_failure)(
                    self.peer,
                    SceneCastError::transport(self.peer, format!("{} payloads queued", self.max_queued)),
                );
                return;
            }
            state.queue.push_back(payload);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let outbox = self.clone();
        if self.scheduler.submit_fn(move || outbox.drain()).is_err() {
            let mut state = self.state.lock();
            state.draining = false;
            state.queue.clear();
        }
    }

    fn drain(&self) -> SceneCastResult<()> {
        loop {
            let payload = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(payload) if !state.closed => payload,
                    _ => {
                        state.queue.clear();
                        state.draining = false;
                        return Ok(());
                    }
                }
            };

            if let Err(err) = self.transport.send(self.peer, &payload) {
                if let SceneCastError::MessageTooLarge(size) = err {
                    warn!(peer = %self.peer, size, "oversized payload dropped");
                    continue;
                }
                {
                    let mut state = self.state.lock();
                    state.queue.clear();
                    state.draining = false;
                    state.closed = true;
                }
                trace!(peer = %self.peer, error = %err, "send failed, outbox closed");
                (self.on_failure)(self.peer, err);
                return Ok(());
            }
        }
    }

    /// Drop queued payloads and refuse new ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecast_sched::SchedulerConfig;
    use scenecast_transport::{LoopbackHub, LoopbackTransport, TransportHandler};
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        received: Mutex<Vec<Bytes>>,
    }

    impl TransportHandler for Sink {
        fn on_receive(&self, _peer: ParticipantId, payload: Bytes) {
            self.received.lock().push(payload);
        }

        fn on_disconnected(&self, _peer: ParticipantId) {}
    }

    fn scheduler(workers: usize) -> Arc<TaskScheduler> {
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig {
                pool_size: workers,
                ..Default::default()
            },
            None,
        ));
        scheduler.start().unwrap();
        scheduler
    }

    #[test]
    fn test_payloads_arrive_in_push_order() {
        let hub = LoopbackHub::new();
        let a: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(&hub, ParticipantId::new(1), "a").unwrap());
        let b = LoopbackTransport::new(&hub, ParticipantId::new(2), "b").unwrap();
        let sink = Arc::new(Sink::default());
        a.start(Arc::new(Sink::default())).unwrap();
        b.start(sink.clone()).unwrap();
        a.connect(ParticipantId::new(2)).unwrap();

        let pool = scheduler(4);
        let outbox = PeerOutbox::new(
            ParticipantId::new(2),
            a.clone(),
            pool.clone(),
            DEFAULT_MAX_QUEUED_SENDS,
            Arc::new(|_: ParticipantId, _: SceneCastError| {}),
        );
        for i in 0u32..500 {
            outbox.push(Bytes::copy_from_slice(&i.to_le_bytes()));
        }
        assert!(pool.drain(Duration::from_secs(5)));

        let received = sink.received.lock();
        assert_eq!(received.len(), 500);
        for (i, payload) in received.iter().enumerate() {
            assert_eq!(payload.as_ref(), &(i as u32).to_le_bytes());
        }
    }

    #[test]
    fn test_send_failure_closes_and_reports() {
        let hub = LoopbackHub::new();
        let a: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(&hub, ParticipantId::new(1), "a").unwrap());
        a.start(Arc::new(Sink::default())).unwrap();

        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();
        let pool = scheduler(1);
        let outbox = PeerOutbox::new(
            ParticipantId::new(7),
            a,
            pool.clone(),
            DEFAULT_MAX_QUEUED_SENDS,
            Arc::new(move |peer: ParticipantId, _: SceneCastError| seen.lock().push(peer)),
        );
        outbox.push(Bytes::from_static(b"one"));
        outbox.push(Bytes::from_static(b"two"));
        assert!(pool.drain(Duration::from_secs(5)));

        assert_eq!(*failures.lock(), vec![ParticipantId::new(7)]);
        assert!(outbox.is_closed());
        outbox.push(Bytes::from_static(b"three"));
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn test_queue_overflow_reports_failure_once() {
        let hub = LoopbackHub::new();
        let a: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(&hub, ParticipantId::new(1), "a").unwrap());
        // never started, so nothing drains
        let pool = Arc::new(TaskScheduler::new(SchedulerConfig::default(), None));

        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();
        let outbox = PeerOutbox::new(
            ParticipantId::new(2),
            a,
            pool,
            4,
            Arc::new(move |peer: ParticipantId, err: SceneCastError| seen.lock().push((peer, err.is_absorbed()))),
        );
        for i in 0u8..6 {
            outbox.push(Bytes::copy_from_slice(&[i]));
        }

        assert_eq!(*failures.lock(), vec![(ParticipantId::new(2), true)]);
        assert!(outbox.is_closed());
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn test_oversized_payload_is_skipped() {
        let hub = LoopbackHub::new();
        let a: Arc<dyn Transport> = Arc::new(LoopbackTransport::new(&hub, ParticipantId::new(1), "a").unwrap());
        let b = LoopbackTransport::new(&hub, ParticipantId::new(2), "b").unwrap();
        let sink = Arc::new(Sink::default());
        a.start(Arc::new(Sink::default())).unwrap();
        b.start(sink.clone()).unwrap();
        a.connect(ParticipantId::new(2)).unwrap();

        let failures = Arc::new(Mutex::new(0usize));
        let seen = failures.clone();
        let pool = scheduler(1);
        let outbox = PeerOutbox::new(
            ParticipantId::new(2),
            a.clone(),
            pool.clone(),
            DEFAULT_MAX_QUEUED_SENDS,
            Arc::new(move |_: ParticipantId, _: SceneCastError| *seen.lock() += 1),
        );
        outbox.push(Bytes::from(vec![0u8; scenecast_wire::MAX_MESSAGE_SIZE + 1]));
        outbox.push(Bytes::from_static(b"after"));
        assert!(pool.drain(Duration::from_secs(5)));

        assert_eq!(*failures.lock(), 0);
        assert!(!outbox.is_closed());
        assert_eq!(sink.received.lock().as_slice(), &[Bytes::from_static(b"after")]);
        assert!(a.is_connected(ParticipantId::new(2)));
    }
}

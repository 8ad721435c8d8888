//! Consumer-side reorder buffer

use std::collections::BTreeMap;

use scenecast_core::{Flush, SceneCastError, SceneCastResult, SceneId, SequenceNumber};
use tracing::{debug, trace, warn};

/// Default bound on flushes waiting for a gap to fill
pub const DEFAULT_MAX_PENDING_FLUSHES: usize = 1024;

/// Releases the flushes of one scene strictly in sequence order
///
/// Until the starting sequence is known (the provider's subscription
/// acceptance), arrivals are only buffered. At most `max_pending` flushes
/// wait at a time; the arrival that would exceed it is refused with
/// `ReorderOverflow`.
#[derive(Debug)]
pub struct FlushReceiver {
    scene: SceneId,
    next_expected: Option<SequenceNumber>,
    highest_applied: Option<SequenceNumber>,
    pending: BTreeMap<SequenceNumber, Flush>,
    max_pending: usize,
}

impl FlushReceiver {
    pub fn new(scene: SceneId) -> Self {
        Self::with_limit(scene, DEFAULT_MAX_PENDING_FLUSHES)
    }

    pub fn with_limit(scene: SceneId, max_pending: usize) -> Self {
        FlushReceiver {
            scene,
            next_expected: None,
            highest_applied: None,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Fix the first sequence number to apply; returns flushes now ready
    pub fn start_at(&mut self, first: SequenceNumber) -> Vec<Flush> {
        if self.next_expected.is_some() {
            return Vec::new();
        }
        self.next_expected = Some(first);
        self.pending = self.pending.split_off(&first);
        self.drain_ready()
    }

    /// Accept one arrival; returns the flushes that became applicable
    ///
    /// Arrivals at or below the highest applied number, or already buffered,
    /// come back as `ProtocolOrderingViolation` and are otherwise ignored.
    /// The next expected flush is always accepted, even with a full buffer.
    pub fn offer(&mut self, flush: Flush) -> SceneCastResult<Vec<Flush>> {
        let sequence = flush.sequence;
        if let Some(next) = self.next_expected {
            if sequence < next {
                debug!(scene = %self.scene, sequence = %sequence, next = %next, "stale flush discarded");
                return Err(self.violation(sequence));
            }
        }
        if self.pending.contains_key(&sequence) {
            debug!(scene = %self.scene, sequence = %sequence, "duplicate flush discarded");
            return Err(self.violation(sequence));
        }
        let in_order = self.next_expected == Some(sequence);
        if !in_order && self.pending.len() >= self.max_pending {
            warn!(
                scene = %self.scene,
                sequence = %sequence,
                limit = self.max_pending,
                "reorder buffer full"
            );
            return Err(SceneCastError::ReorderOverflow {
                scene: self.scene,
                limit: self.max_pending,
            });
        }
        if !in_order {
            trace!(scene = %self.scene, sequence = %sequence, waiting = self.pending.len() + 1, "flush buffered");
        }
        self.pending.insert(sequence, flush);
        Ok(self.drain_ready())
    }

    fn drain_ready(&mut self) -> Vec<Flush> {
        let mut ready = Vec::new();
        let Some(mut next) = self.next_expected else {
            return ready;
        };
        while let Some(flush) = self.pending.remove(&next) {
            self.highest_applied = Some(next);
            next = next.next();
            ready.push(flush);
        }
        self.next_expected = Some(next);
        ready
    }

    fn violation(&self, sequence: SequenceNumber) -> SceneCastError {
        let highest_applied = self
            .next_expected
            .map(|n| SequenceNumber(n.0.saturating_sub(1)))
            .unwrap_or_default();
        SceneCastError::ProtocolOrderingViolation {
            scene: self.scene,
            sequence,
            highest_applied,
        }
    }

    pub fn scene(&self) -> SceneId {
        self.scene
    }

    pub fn highest_applied(&self) -> Option<SequenceNumber> {
        self.highest_applied
    }

    pub fn next_expected(&self) -> Option<SequenceNumber> {
        self.next_expected
    }

    /// Arrivals waiting for a gap to fill
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

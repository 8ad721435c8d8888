//! Participant registry
//!
//! Owns the identity record of every participant this process knows about.
//! Connections and discovery entries hold `Arc` references into it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use scenecast_core::{ParticipantAddress, ParticipantId, ParticipantIdentifier};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    entries: RwLock<HashMap<ParticipantId, Arc<ParticipantIdentifier>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identity; a changed identity for a known id replaces the old one
    pub fn register(&self, identifier: ParticipantIdentifier) -> Arc<ParticipantIdentifier> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&identifier.id) {
            if **existing == identifier {
                return existing.clone();
            }
        }
        debug!(participant = %identifier, "registered participant");
        let identifier = Arc::new(identifier);
        entries.insert(identifier.id, identifier.clone());
        identifier
    }

    pub fn resolve(&self, id: ParticipantId) -> Option<ParticipantAddress> {
        self.entries.read().get(&id).map(|i| i.address)
    }

    pub fn identifier(&self, id: ParticipantId) -> Option<Arc<ParticipantIdentifier>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn unregister(&self, id: ParticipantId) -> Option<Arc<ParticipantIdentifier>> {
        self.entries.write().remove(&id)
    }

    pub fn snapshot(&self) -> Vec<Arc<ParticipantIdentifier>> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by_key(|i| i.id);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

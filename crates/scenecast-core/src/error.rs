//! Error types for SceneCast

use thiserror::Error;

use crate::{ParticipantId, SceneId, SequenceNumber};

/// Core SceneCast errors
#[derive(Error, Debug)]
pub enum SceneCastError {
    // Transport errors
    #[error("Transport failure with {peer}: {reason}")]
    TransportFailure { peer: ParticipantId, reason: String },

    #[error("Discovery daemon unreachable at {address}: {reason}")]
    DiscoveryUnreachable { address: String, reason: String },

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    // Ordering errors
    #[error("Ordering violation on scene {scene}: seq {sequence} <= highest applied {highest_applied}")]
    ProtocolOrderingViolation {
        scene: SceneId,
        sequence: SequenceNumber,
        highest_applied: SequenceNumber,
    },

    #[error("Reorder buffer of scene {scene} overflowed at {limit} waiting flushes")]
    ReorderOverflow { scene: SceneId, limit: usize },

    // Scheduler errors
    #[error("Task failed on worker {worker}: {reason}")]
    WorkerTaskFailure { worker: usize, reason: String },

    #[error("Scheduler is not accepting tasks")]
    SchedulerStopped,

    // Scene errors
    #[error("Scene {0} is not published")]
    SceneNotPublished(SceneId),

    #[error("Scene {0} is not available")]
    SceneNotAvailable(SceneId),

    #[error("Scene {scene} cannot change state from {state}")]
    InvalidSceneState { scene: SceneId, state: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network and local-only transports are mutually exclusive")]
    ConflictingTransports,

    #[error("Invalid discovery address: {0}")]
    InvalidDiscoveryAddress(String),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SceneCastError {
    pub fn transport(peer: ParticipantId, reason: impl ToString) -> Self {
        SceneCastError::TransportFailure {
            peer,
            reason: reason.to_string(),
        }
    }

    /// Errors the session absorbs into lifecycle events instead of surfacing
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            SceneCastError::TransportFailure { .. }
                | SceneCastError::ProtocolOrderingViolation { .. }
                | SceneCastError::ReorderOverflow { .. }
                | SceneCastError::WorkerTaskFailure { .. }
        )
    }
}

/// Result type for SceneCast operations
pub type SceneCastResult<T> = Result<T, SceneCastError>;

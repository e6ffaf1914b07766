//! Error types for the tillsync engine.

use crate::{ConflictId, QueueId, RecordId, SchemaVersion, TableName, Version};
use thiserror::Error;

/// All possible errors from the tillsync engine.
///
/// The sync taxonomy (`Network`, `SchemaMismatch`, `VersionConflict`,
/// `SyncLockHeld`, `MaxAttemptsExceeded`, `CorruptionDetected`) lives next to
/// the validation and conflict-log errors so every crate in the workspace can
/// report through one type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown table: {0}")]
    UnknownTable(TableName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Ingestion errors
    #[error("record already exists: {table}/{record_id}")]
    RecordExists {
        table: TableName,
        record_id: RecordId,
    },

    #[error("record not found: {table}/{record_id}")]
    RecordNotFound {
        table: TableName,
        record_id: RecordId,
    },

    #[error("record {table}/{record_id} is locked pending review of conflict {conflict_id}")]
    RecordLocked {
        table: TableName,
        record_id: RecordId,
        conflict_id: ConflictId,
    },

    // Sync taxonomy
    #[error("network error: {0}")]
    Network(String),

    #[error("schema version mismatch: device has {local}, cloud accepts {remote}")]
    SchemaMismatch {
        local: SchemaVersion,
        remote: SchemaVersion,
    },

    #[error("version conflict on {table}/{record_id}: {incoming} does not advance {current}")]
    VersionConflict {
        table: TableName,
        record_id: RecordId,
        incoming: Version,
        current: Version,
    },

    #[error("sync lock held by {holder}")]
    SyncLockHeld { holder: String },

    #[error("queue entry {queue_id} exceeded {attempts} attempts")]
    MaxAttemptsExceeded { queue_id: QueueId, attempts: u32 },

    #[error("corruption detected on {table}/{record_id}: {detail}")]
    CorruptionDetected {
        table: TableName,
        record_id: RecordId,
        detail: String,
    },

    // Conflict log errors
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("conflict already resolved: {0}")]
    AlreadyResolved(ConflictId),

    #[error("conflict {0} is not awaiting manual review")]
    NotReviewable(ConflictId),

    // Queue errors
    #[error("invalid queue transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    /// Whether the failure is transient and the work should be retried
    /// through the queue's backoff path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether the failure must be surfaced to an operator.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            Error::MaxAttemptsExceeded { .. } | Error::CorruptionDetected { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

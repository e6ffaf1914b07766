//! Wire types shared by the device client and the cloud service.
//!
//! All JSON is snake_case. The batch endpoint answers one [`ChangeResult`]
//! per uploaded change; the pull endpoint pages through the cloud's change
//! feed by sequence number.

use crate::{
    ChangeId, ChangeRecord, ConflictId, ConflictLogEntry, DeviceId, RecordId, Resolution,
    SchemaVersion, Sequence, Side, StoredRecord, TableName, Version,
};
use serde::{Deserialize, Serialize};

/// Page size used when a pull does not ask for one.
pub const DEFAULT_PULL_LIMIT: usize = 100;

/// Largest page a pull may ask for.
pub const MAX_PULL_LIMIT: usize = 1000;

/// `POST /sync/batch` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub device_id: DeviceId,
    pub schema_version: SchemaVersion,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Applied,
    Conflict,
}

/// Outcome of one uploaded change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeResult {
    pub change_id: ChangeId,
    pub table_name: TableName,
    pub record_id: RecordId,
    /// Authoritative version after processing
    pub version: Version,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<ConflictId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictLogEntry>,
}

impl ChangeResult {
    pub fn applied(change: &ChangeRecord, version: Version) -> Self {
        Self {
            change_id: change.change_id,
            table_name: change.table_name.clone(),
            record_id: change.record_id.clone(),
            version,
            status: ResultStatus::Applied,
            conflict_id: None,
            resolution: None,
            conflict: None,
        }
    }

    pub fn conflict(change: &ChangeRecord, version: Version, entry: ConflictLogEntry) -> Self {
        Self {
            change_id: change.change_id,
            table_name: change.table_name.clone(),
            record_id: change.record_id.clone(),
            version,
            status: ResultStatus::Conflict,
            conflict_id: Some(entry.conflict_id),
            resolution: Some(entry.resolution),
            conflict: Some(entry),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status == ResultStatus::Applied
    }
}

/// `POST /sync/batch` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<ChangeResult>,
}

impl BatchResponse {
    pub fn result_for(&self, change_id: ChangeId) -> Option<&ChangeResult> {
        self.results.iter().find(|r| r.change_id == change_id)
    }
}

/// `GET /sync/pull` query string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub since: Sequence,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PullQuery {
    pub fn new(since: Sequence, limit: usize) -> Self {
        Self {
            since,
            limit: Some(limit),
        }
    }

    /// Requested page size, defaulted and clamped to `1..=max`.
    pub fn effective_limit(&self, max: usize) -> usize {
        self.limit.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, max.max(1))
    }
}

/// Why an entry is in the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedReason {
    /// A plain accepted write
    Write,
    /// A last-write-wins merge produced a new authoritative version
    AutoResolved { conflict_id: ConflictId },
    /// The uploading device was ahead of the cloud; the cloud state stands
    RolledBack { conflict_id: ConflictId },
    /// An operator settled a held conflict
    ManualResolution { conflict_id: ConflictId },
}

impl FeedReason {
    /// Overrides are authoritative and replace local state unconditionally.
    pub fn is_override(&self) -> bool {
        !matches!(self, FeedReason::Write)
    }

    pub fn conflict_id(&self) -> Option<ConflictId> {
        match self {
            FeedReason::Write => None,
            FeedReason::AutoResolved { conflict_id }
            | FeedReason::RolledBack { conflict_id }
            | FeedReason::ManualResolution { conflict_id } => Some(*conflict_id),
        }
    }
}

/// A feed entry before the cloud assigns it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub change: ChangeRecord,
    pub reason: FeedReason,
}

impl FeedEntry {
    /// Describe the stored record's current state as a feed entry.
    pub fn from_record(record: &StoredRecord, base_version: Version, reason: FeedReason) -> Self {
        Self {
            change: record.to_change(base_version),
            reason,
        }
    }

    pub fn sequenced(self, sequence: Sequence) -> RemoteChange {
        RemoteChange {
            sequence,
            change: self.change,
            reason: self.reason,
        }
    }
}

/// One entry of the change feed as served to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub sequence: Sequence,
    pub change: ChangeRecord,
    pub reason: FeedReason,
}

/// `GET /sync/pull` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    /// Cursor to pass as `since` on the next pull
    pub next_seq: Sequence,
    #[serde(default)]
    pub has_more: bool,
}

/// `GET /sync/schema` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub schema_version: SchemaVersion,
}

/// `POST /sync/conflicts/{id}/resolve` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub side: Side,
    pub resolver: String,
}

/// `POST /sync/conflicts/{id}/resolve` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub conflict: ConflictLogEntry,
    pub record: StoredRecord,
}

//! Change records: the unit of synchronization.
//!
//! Every syncable mutation is captured as a [`ChangeRecord`] by the device's
//! change tracker. Change records are immutable once created; they travel in
//! the outbox, across the wire, and back down the cloud's change feed.

use crate::{
    ChangeId, DeviceId, RecordId, TableName, TablePayload, Timestamp, UserId, Version, WriteStamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(OpType::Insert),
            "update" => Some(OpType::Update),
            "delete" => Some(OpType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a syncable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table_name: TableName,
    pub record_id: RecordId,
}

impl RecordKey {
    pub fn new(table_name: impl Into<TableName>, record_id: impl Into<RecordId>) -> Self {
        Self {
            table_name: table_name.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table_name, self.record_id)
    }
}

/// A versioned, stamped description of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Idempotency key the cloud deduplicates on
    pub change_id: ChangeId,
    pub table_name: TableName,
    pub record_id: RecordId,
    /// Terminal that produced the change
    pub device_id: DeviceId,
    /// Session user at the time of the change
    pub user_id: Option<UserId>,
    /// Version after this change (monotonic, >= 1)
    pub version: Version,
    /// Cloud version the device last observed before its pending edits
    pub base_version: Version,
    /// When the change was made (UTC)
    pub last_modified: Timestamp,
    pub op_type: OpType,
    /// Row snapshot after the change (`None` for deletes)
    pub payload: Option<TablePayload>,
}

impl ChangeRecord {
    /// Create a change for a single edit: `base_version` is `version - 1`.
    pub fn new(
        op_type: OpType,
        key: RecordKey,
        device_id: impl Into<DeviceId>,
        version: Version,
        last_modified: Timestamp,
    ) -> Self {
        Self {
            change_id: uuid::Uuid::new_v4(),
            table_name: key.table_name,
            record_id: key.record_id,
            device_id: device_id.into(),
            user_id: None,
            version,
            base_version: version.saturating_sub(1),
            last_modified,
            op_type,
            payload: None,
        }
    }

    /// Builder-style payload setter.
    pub fn with_payload(mut self, payload: TablePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builder-style base version setter (for coalesced changes).
    pub fn with_base_version(mut self, base_version: Version) -> Self {
        self.base_version = base_version;
        self
    }

    /// Builder-style user setter.
    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    pub fn stamp(&self) -> WriteStamp {
        WriteStamp::new(self.last_modified, self.device_id.clone())
    }

    pub fn is_delete(&self) -> bool {
        self.op_type == OpType::Delete
    }

    /// Fold a newer change for the same record into this one, keeping the
    /// identity and the base version the cloud will compare against.
    pub fn supersede_with(&self, newer: &ChangeRecord) -> ChangeRecord {
        let op_type = match (self.op_type, newer.op_type) {
            // a row created offline is still an insert from the cloud's view
            (OpType::Insert, OpType::Update) => OpType::Insert,
            (_, op) => op,
        };
        ChangeRecord {
            change_id: newer.change_id,
            op_type,
            base_version: self.base_version,
            ..newer.clone()
        }
    }
}

//! Stored record state.

use crate::{
    error::Result, ChangeRecord, DeviceId, Error, OpType, RecordId, RecordKey, TableName,
    TablePayload, Timestamp, UserId, Version, WriteStamp,
};
use serde::{Deserialize, Serialize};

/// The current state of one syncable row, on a device or in the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub table_name: TableName,
    pub record_id: RecordId,
    /// Version number, strictly increasing across accepted writes
    pub version: Version,
    /// Never decreases across accepted writes
    pub last_modified: Timestamp,
    /// Terminal that produced the current state
    pub device_id: DeviceId,
    pub user_id: Option<UserId>,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// Row snapshot (`None` once deleted)
    pub payload: Option<TablePayload>,
}

impl StoredRecord {
    /// Create a record from the change that introduces it.
    pub fn from_change(change: &ChangeRecord) -> Self {
        Self {
            table_name: change.table_name.clone(),
            record_id: change.record_id.clone(),
            version: change.version,
            last_modified: change.last_modified,
            device_id: change.device_id.clone(),
            user_id: change.user_id.clone(),
            deleted: change.is_delete(),
            payload: if change.is_delete() {
                None
            } else {
                change.payload.clone()
            },
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    pub fn stamp(&self) -> WriteStamp {
        WriteStamp::new(self.last_modified, self.device_id.clone())
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Move this record forward to the state described by `change`.
    ///
    /// Fails with [`Error::VersionConflict`] unless the change's version is
    /// strictly greater than the stored one. `last_modified` is clamped so it
    /// never moves backwards.
    pub fn advance(&mut self, change: &ChangeRecord) -> Result<()> {
        if change.version <= self.version {
            return Err(Error::VersionConflict {
                table: self.table_name.clone(),
                record_id: self.record_id.clone(),
                incoming: change.version,
                current: self.version,
            });
        }
        self.version = change.version;
        self.last_modified = self.last_modified.max(change.last_modified);
        self.device_id = change.device_id.clone();
        self.user_id = change.user_id.clone();
        self.deleted = change.is_delete();
        self.payload = if change.is_delete() {
            None
        } else {
            change.payload.clone()
        };
        Ok(())
    }

    /// Whether `change` is a redelivery of the write that produced this state.
    pub fn is_echo_of(&self, change: &ChangeRecord) -> bool {
        self.version == change.version
            && self.device_id == change.device_id
            && self.deleted == change.is_delete()
            && (self.deleted || self.payload == change.payload)
    }

    /// Describe this state as a change, for the cloud's change feed.
    pub fn to_change(&self, base_version: Version) -> ChangeRecord {
        let op_type = if self.deleted {
            OpType::Delete
        } else if base_version == 0 {
            OpType::Insert
        } else {
            OpType::Update
        };
        ChangeRecord {
            change_id: uuid::Uuid::new_v4(),
            table_name: self.table_name.clone(),
            record_id: self.record_id.clone(),
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            version: self.version,
            base_version,
            last_modified: self.last_modified,
            op_type,
            payload: self.payload.clone(),
        }
    }
}

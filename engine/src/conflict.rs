//! Conflict log entries.
//!
//! The conflict log is an append-only audit trail of every non-trivial merge
//! and every unresolved conflict. Entries hold immutable payload snapshots and
//! are never changed except to set their resolution fields exactly once.

use crate::{
    error::Result, ConflictId, DeviceId, Error, RecordId, RecordKey, TableName, TablePayload,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolver tag written on last-write-wins entries.
pub const LWW_RESOLVER: &str = "system:last-write-wins";

/// Resolver tag written on version-mismatch rollbacks.
pub const ROLLBACK_RESOLVER: &str = "system:rollback";

/// Resolver tag written when the queue gives up on an entry.
pub const RETRY_RESOLVER: &str = "system:max-attempts";

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The device's observed version is ahead of the cloud's
    VersionMismatch,
    /// Two writers edited the same record concurrently
    DataConflict,
    /// The queue exhausted its retries for a change
    SyncFailure,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::VersionMismatch => "version_mismatch",
            ConflictType::DataConflict => "data_conflict",
            ConflictType::SyncFailure => "sync_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "version_mismatch" => Some(ConflictType::VersionMismatch),
            "data_conflict" => Some(ConflictType::DataConflict),
            "sync_failure" => Some(ConflictType::SyncFailure),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the conflict was (or will be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    AutoResolved,
    ManualReview,
    RolledBack,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::AutoResolved => "auto_resolved",
            Resolution::ManualReview => "manual_review",
            Resolution::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto_resolved" => Some(Resolution::AutoResolved),
            "manual_review" => Some(Resolution::ManualReview),
            "rolled_back" => Some(Resolution::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which snapshot won a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The uploading device's payload
    Local,
    /// The cloud's stored payload
    Remote,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Side::Local),
            "remote" => Some(Side::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record in the conflict log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub conflict_id: ConflictId,
    pub table_name: TableName,
    pub record_id: RecordId,
    /// Device whose upload caused the entry
    pub device_id: DeviceId,
    pub conflict_type: ConflictType,
    pub local_version: Version,
    pub remote_version: Version,
    pub local_data: Option<TablePayload>,
    pub remote_data: Option<TablePayload>,
    pub resolution: Resolution,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<Timestamp>,
    /// Winning side, once known
    #[serde(default)]
    pub winner: Option<Side>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
}

impl ConflictLogEntry {
    /// Create an open entry for `key` with a fresh id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &RecordKey,
        device_id: impl Into<DeviceId>,
        conflict_type: ConflictType,
        resolution: Resolution,
        local_version: Version,
        remote_version: Version,
        local_data: Option<TablePayload>,
        remote_data: Option<TablePayload>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            conflict_id: uuid::Uuid::new_v4(),
            table_name: key.table_name.clone(),
            record_id: key.record_id.clone(),
            device_id: device_id.into(),
            conflict_type,
            local_version,
            remote_version,
            local_data,
            remote_data,
            resolution,
            resolved_by: None,
            resolved_at: None,
            winner: None,
            error_message: None,
            created_at,
        }
    }

    /// Entry written when a queued change is abandoned after too many retries.
    pub fn sync_failure(
        key: &RecordKey,
        device_id: impl Into<DeviceId>,
        local_version: Version,
        local_data: Option<TablePayload>,
        error_message: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        let mut entry = Self::new(
            key,
            device_id,
            ConflictType::SyncFailure,
            Resolution::RolledBack,
            local_version,
            0,
            local_data,
            None,
            now,
        );
        entry.resolved_by = Some(RETRY_RESOLVER.to_string());
        entry.resolved_at = Some(now);
        entry.error_message = Some(error_message.into());
        entry
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    /// Whether the entry still awaits an operator.
    pub fn is_open(&self) -> bool {
        self.resolution == Resolution::ManualReview && self.resolved_at.is_none()
    }

    /// Set the resolution fields. Only an open manual-review entry may be
    /// resolved, and only once.
    pub fn mark_resolved(
        &mut self,
        winner: Side,
        resolved_by: impl Into<String>,
        now: Timestamp,
    ) -> Result<()> {
        if self.resolution != Resolution::ManualReview {
            return Err(Error::NotReviewable(self.conflict_id));
        }
        if self.resolved_at.is_some() {
            return Err(Error::AlreadyResolved(self.conflict_id));
        }
        self.winner = Some(winner);
        self.resolved_by = Some(resolved_by.into());
        self.resolved_at = Some(now);
        Ok(())
    }

    /// Payload of the chosen side.
    pub fn payload_for(&self, side: Side) -> Option<&TablePayload> {
        match side {
            Side::Local => self.local_data.as_ref(),
            Side::Remote => self.remote_data.as_ref(),
        }
    }
}

/// Filter for listing conflict log entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictQuery {
    #[serde(default)]
    pub table: Option<TableName>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Only unresolved manual-review entries
    #[serde(default)]
    pub open: Option<bool>,
    /// Created at or after
    #[serde(default)]
    pub since: Option<Timestamp>,
    /// Created before
    #[serde(default)]
    pub until: Option<Timestamp>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ConflictQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only open manual-review entries.
    pub fn open() -> Self {
        Self {
            open: Some(true),
            ..Self::default()
        }
    }

    pub fn table(mut self, table: impl Into<TableName>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn between(mut self, since: Timestamp, until: Timestamp) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &ConflictLogEntry) -> bool {
        if let Some(table) = &self.table {
            if &entry.table_name != table {
                return false;
            }
        }
        if let Some(resolution) = self.resolution {
            if entry.resolution != resolution {
                return false;
            }
        }
        if let Some(open) = self.open {
            if entry.is_open() != open {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.created_at >= until {
                return false;
            }
        }
        true
    }

    /// Apply the filter and limit to entries already in creation order.
    pub fn select<'a, I>(&self, entries: I) -> Vec<&'a ConflictLogEntry>
    where
        I: IntoIterator<Item = &'a ConflictLogEntry>,
    {
        entries
            .into_iter()
            .filter(|e| self.matches(e))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

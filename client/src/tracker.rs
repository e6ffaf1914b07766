//! Change Tracker: the single gateway for syncable mutations.
//!
//! A local write stamps version, time and origin, updates the synced row and
//! appends to the outbox in one transaction. Remote changes pulled from the
//! cloud come back in through [`ChangeTracker::apply_remote_in`], which trusts
//! the cloud's version.

use crate::conflict_log::ConflictLog;
use crate::db::{self, Pool};
use crate::error::Result;
use crate::queue::SyncQueue;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::sync::{Arc, RwLock};
use tillsync_engine::{
    ChangeRecord, DeviceId, Error, FeedReason, OpType, RecordKey, RemoteChange, Schema,
    StoredRecord, Timestamp, UserId, Version,
};

/// What happened to a pulled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Applied,
    /// Not newer than local state, or local edits are still on their way up
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ChangeTracker {
    pool: Pool,
    schema: Arc<Schema>,
    device_id: DeviceId,
    session: Arc<RwLock<Option<UserId>>>,
}

impl ChangeTracker {
    pub fn new(pool: Pool, schema: Arc<Schema>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            pool,
            schema,
            device_id: device_id.into(),
            session: Arc::new(RwLock::new(None)),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Set (or clear) the user stamped on subsequent changes.
    pub fn set_session_user(&self, user: Option<UserId>) {
        if let Ok(mut session) = self.session.write() {
            *session = user;
        }
    }

    pub fn session_user(&self) -> Option<UserId> {
        self.session.read().ok().and_then(|user| user.clone())
    }

    /// Record a local mutation and queue it for upload.
    ///
    /// Returns the record's new version.
    pub async fn submit_change(
        &self,
        table: &str,
        record_id: &str,
        op: OpType,
        payload: Option<Value>,
    ) -> Result<Version> {
        let mut tx = self.pool.begin().await?;
        let change = self
            .submit_change_in(&mut tx, table, record_id, op, payload, db::now())
            .await?;
        tx.commit().await?;
        Ok(change.version)
    }

    /// Like [`submit_change`](Self::submit_change), inside a caller's
    /// transaction so business writes commit or roll back with the outbox.
    pub async fn submit_change_in(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        record_id: &str,
        op: OpType,
        payload: Option<Value>,
        now: Timestamp,
    ) -> Result<ChangeRecord> {
        let key = RecordKey::new(table, record_id);
        self.schema.table(table)?;
        let payload = match (op, payload) {
            (OpType::Delete, _) => None,
            (_, Some(data)) => Some(self.schema.decode_payload(table, data)?),
            (_, None) => {
                return Err(Error::InvalidPayload(format!("{key}: {op} requires a payload")).into())
            }
        };

        if let Some(conflict_id) = SyncQueue::held_conflict_in(conn, &key).await? {
            return Err(Error::RecordLocked {
                table: key.table_name,
                record_id: key.record_id,
                conflict_id,
            }
            .into());
        }

        let previous = db::load_record(conn, &key).await?;
        let live = previous.as_ref().filter(|r| r.is_active());
        let version = match (op, live) {
            (OpType::Insert, Some(_)) => {
                return Err(Error::RecordExists {
                    table: key.table_name,
                    record_id: key.record_id,
                }
                .into())
            }
            (OpType::Update | OpType::Delete, None) => {
                return Err(Error::RecordNotFound {
                    table: key.table_name,
                    record_id: key.record_id,
                }
                .into())
            }
            // re-inserting over a tombstone continues its version line
            _ => previous.as_ref().map_or(1, |r| r.version + 1),
        };
        let last_modified = previous
            .as_ref()
            .map_or(now, |r| r.last_modified.max(now));

        // queued edits chain onto each other; otherwise the cloud compares
        // against the last version it confirmed, which an abandoned edit
        // never reached
        let chained = version.saturating_sub(1);
        let base_version = if SyncQueue::has_unsettled_in(conn, &key).await? {
            chained
        } else {
            db::synced_version(conn, &key).await?.min(chained)
        };

        let mut change =
            ChangeRecord::new(op, key.clone(), self.device_id.clone(), version, last_modified)
                .with_base_version(base_version);
        change.payload = payload;
        change.user_id = self.session_user();
        self.schema.validate_change(&change)?;

        let record = match previous {
            Some(mut record) => {
                record.advance(&change)?;
                record
            }
            None => StoredRecord::from_change(&change),
        };
        db::upsert_record(conn, &record).await?;
        let queue_id = SyncQueue::enqueue_in(conn, &change, now).await?;

        tracing::debug!(
            table,
            record_id,
            op = %op,
            version,
            queue_id,
            "local change recorded"
        );
        Ok(change)
    }

    /// Apply one change-feed entry to the local store.
    ///
    /// Ordinary writes are skipped when they are not newer than the local row
    /// or when the row still has outbound changes. Overrides are applied
    /// unconditionally; a manual resolution also releases the held outbox
    /// entry and closes the mirrored conflict.
    pub async fn apply_remote_in(
        conn: &mut SqliteConnection,
        remote: &RemoteChange,
        now: Timestamp,
    ) -> Result<RemoteApply> {
        let change = &remote.change;
        let key = change.key();

        if !remote.reason.is_override() {
            let local = db::load_record(conn, &key).await?;
            if let Some(local) = local.filter(|r| r.version >= change.version) {
                if local.is_echo_of(change) {
                    let synced = db::synced_version(conn, &key).await?;
                    db::set_synced_version(conn, &key, synced.max(change.version)).await?;
                }
                return Ok(RemoteApply::Skipped);
            }
            if SyncQueue::has_unsettled_in(conn, &key).await? {
                tracing::debug!(
                    key = %key,
                    sequence = remote.sequence,
                    "remote write deferred behind local changes"
                );
                return Ok(RemoteApply::Skipped);
            }
        }

        db::upsert_record(conn, &StoredRecord::from_change(change)).await?;
        db::set_synced_version(conn, &key, change.version).await?;

        if let FeedReason::ManualResolution { conflict_id } = remote.reason {
            let released = SyncQueue::release_in(conn, conflict_id, now).await?;
            let resolved_by = change.user_id.as_deref().unwrap_or(change.device_id.as_str());
            let resolved_at = change.last_modified;
            ConflictLog::mark_resolved_in(conn, conflict_id, None, resolved_by, resolved_at).await?;
            tracing::info!(
                key = %key,
                %conflict_id,
                version = change.version,
                released,
                "manual resolution applied"
            );
        } else if let Some(conflict_id) = remote.reason.conflict_id() {
            tracing::debug!(
                key = %key,
                %conflict_id,
                version = change.version,
                "authoritative override applied"
            );
        }

        Ok(RemoteApply::Applied)
    }
}

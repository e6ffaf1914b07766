//! Persistent outbound queue (the outbox).
//!
//! Entries move through the engine's [`QueueStatus`] state machine. Every
//! mutation loads the entry, applies the transition in memory, and writes it
//! back inside one SQLite transaction; nothing is cached between calls.

use crate::conflict_log::ConflictLog;
use crate::db::{from_millis, opt_from_millis, to_millis, Pool};
use crate::error::{ClientError, Result};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use tillsync_engine::{
    select_batch, ChangeRecord, ConflictId, ConflictLogEntry, QueueId, QueueStatus, RecordKey,
    RetryDecision, RetryPolicy, SyncQueueEntry, Timestamp,
};

const COLUMNS: &str = "queue_id, change, status, attempt_count, next_retry_at, conflict_id, \
    last_error, transmitted, created_at, updated_at";

/// The device's outbox.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    pool: Pool,
    policy: RetryPolicy,
}

impl SyncQueue {
    pub fn new(pool: Pool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Add a change, superseding an entry for the same record that has never
    /// left the device.
    ///
    /// Enqueueing a change id that is already queued is a no-op.
    pub async fn enqueue_in(
        conn: &mut SqliteConnection,
        change: &ChangeRecord,
        now: Timestamp,
    ) -> Result<QueueId> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT queue_id FROM sync_queue WHERE change_id = ?")
                .bind(change.change_id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        if let Some((queue_id,)) = existing {
            return Ok(queue_id);
        }

        let latest = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM sync_queue
            WHERE table_name = ? AND record_id = ?
              AND status IN ('pending', 'sent', 'failed')
            ORDER BY queue_id DESC
            LIMIT 1
            "#
        ))
        .bind(&change.table_name)
        .bind(&change.record_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = latest {
            let mut entry = entry_from_row(&row)?;
            if entry.supersede(change, now) {
                save(conn, &entry).await?;
                tracing::debug!(
                    queue_id = entry.queue_id,
                    key = %change.key(),
                    version = change.version,
                    "superseded queued change"
                );
                return Ok(entry.queue_id);
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO sync_queue (
                change_id, table_name, record_id, version, change, status,
                attempt_count, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(change.change_id.to_string())
        .bind(&change.table_name)
        .bind(&change.record_id)
        .bind(change.version as i64)
        .bind(serde_json::to_string(change)?)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn enqueue(&self, change: &ChangeRecord, now: Timestamp) -> Result<QueueId> {
        let mut tx = self.pool.begin().await?;
        let queue_id = Self::enqueue_in(&mut tx, change, now).await?;
        tx.commit().await?;
        Ok(queue_id)
    }

    /// Take up to `max` eligible entries in queue order and mark them `sent`.
    pub async fn dequeue_batch(&self, max: usize, now: Timestamp) -> Result<Vec<SyncQueueEntry>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM sync_queue
            WHERE status IN ('pending', 'sent', 'failed', 'conflict')
            ORDER BY queue_id
            "#
        ))
        .fetch_all(&mut *tx)
        .await?;
        let entries = rows.iter().map(entry_from_row).collect::<Result<Vec<_>>>()?;

        let mut batch: Vec<SyncQueueEntry> =
            select_batch(&entries, max, now).into_iter().cloned().collect();
        for entry in &mut batch {
            entry.mark_sent(now)?;
            save(&mut tx, entry).await?;
        }
        tx.commit().await?;

        Ok(batch)
    }

    /// Mark entries as accepted by the cloud.
    pub async fn ack(&self, ids: &[QueueId], now: Timestamp) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for &id in ids {
            Self::ack_in(&mut tx, id, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn ack_in(conn: &mut SqliteConnection, id: QueueId, now: Timestamp) -> Result<()> {
        let mut entry = load(conn, id).await?;
        entry.ack(now)?;
        save(conn, &entry).await
    }

    /// Record a failed attempt. Exhausting the retries abandons the entry and
    /// writes a `sync_failure` conflict entry in the same transaction.
    pub async fn fail(&self, id: QueueId, error: &str, now: Timestamp) -> Result<RetryDecision> {
        let mut tx = self.pool.begin().await?;
        let decision = Self::fail_in(&mut tx, &self.policy, id, error, now).await?;
        tx.commit().await?;
        Ok(decision)
    }

    pub async fn fail_in(
        conn: &mut SqliteConnection,
        policy: &RetryPolicy,
        id: QueueId,
        error: &str,
        now: Timestamp,
    ) -> Result<RetryDecision> {
        let mut entry = load(conn, id).await?;
        let decision = entry.fail(error, policy, now)?;
        save(conn, &entry).await?;

        match decision {
            RetryDecision::Retry { next_retry_at } => {
                tracing::warn!(
                    queue_id = id,
                    key = %entry.key(),
                    attempts = entry.attempt_count,
                    %next_retry_at,
                    error,
                    "upload failed, will retry"
                );
            }
            RetryDecision::Abandon => {
                let failure = ConflictLogEntry::sync_failure(
                    &entry.key(),
                    entry.change.device_id.clone(),
                    entry.change.version,
                    entry.change.payload.clone(),
                    tillsync_engine::Error::MaxAttemptsExceeded {
                        queue_id: id,
                        attempts: entry.attempt_count,
                    }
                    .to_string(),
                    now,
                );
                ConflictLog::append_in(conn, &failure).await?;
                tracing::error!(
                    queue_id = id,
                    key = %entry.key(),
                    attempts = entry.attempt_count,
                    conflict_id = %failure.conflict_id,
                    error,
                    "max attempts exceeded, change abandoned"
                );
            }
        }
        Ok(decision)
    }

    /// Hold an entry for manual review.
    pub async fn hold_in(
        conn: &mut SqliteConnection,
        id: QueueId,
        conflict_id: ConflictId,
        now: Timestamp,
    ) -> Result<()> {
        let mut entry = load(conn, id).await?;
        entry.hold(conflict_id, now)?;
        save(conn, &entry).await
    }

    /// Release entries held for a conflict once it has been resolved.
    pub async fn release_in(
        conn: &mut SqliteConnection,
        conflict_id: ConflictId,
        now: Timestamp,
    ) -> Result<usize> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE conflict_id = ? AND status = 'conflict'"
        ))
        .bind(conflict_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

        let mut released = 0;
        for row in &rows {
            let mut entry = entry_from_row(row)?;
            entry.ack(now)?;
            save(conn, &entry).await?;
            released += 1;
        }
        Ok(released)
    }

    pub async fn abandon_in(
        conn: &mut SqliteConnection,
        id: QueueId,
        reason: &str,
        now: Timestamp,
    ) -> Result<()> {
        let mut entry = load(conn, id).await?;
        entry.abandon(reason, now)?;
        save(conn, &entry).await
    }

    /// Reset entries left `sent` by a crashed or cancelled cycle. They stay
    /// marked as transmitted, so later edits queue behind them.
    pub async fn recover_in_flight(&self, now: Timestamp) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET status = 'pending', transmitted = 1, updated_at = ?
            WHERE status = 'sent'
            "#,
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete acked entries last touched before `older_than`.
    pub async fn purge_acked(&self, older_than: Timestamp) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sync_queue WHERE status = 'acked' AND updated_at < ?")
                .bind(to_millis(older_than))
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Entries not yet settled (pending, sent, failed).
    pub async fn pending_count(&self) -> Result<u64> {
        self.count("status IN ('pending', 'sent', 'failed')").await
    }

    pub async fn abandoned_count(&self) -> Result<u64> {
        self.count("status = 'abandoned'").await
    }

    async fn count(&self, predicate: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM sync_queue WHERE {predicate}"))
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Whether any entry could be uploaded at `now`.
    pub async fn has_eligible(&self, now: Timestamp) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sync_queue
            WHERE status = 'pending'
               OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= ?))
            "#,
        )
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn get(&self, id: QueueId) -> Result<Option<SyncQueueEntry>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sync_queue WHERE queue_id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Entries in queue order, optionally filtered by status.
    pub async fn entries(&self, status: Option<QueueStatus>) -> Result<Vec<SyncQueueEntry>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sync_queue WHERE status = ? ORDER BY queue_id"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM sync_queue ORDER BY queue_id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(entry_from_row).collect()
    }

    /// Whether the record has outbound changes that are not settled yet.
    pub async fn has_unsettled_in(conn: &mut SqliteConnection, key: &RecordKey) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sync_queue
            WHERE table_name = ? AND record_id = ?
              AND status IN ('pending', 'sent', 'failed', 'conflict')
            "#,
        )
        .bind(&key.table_name)
        .bind(&key.record_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    /// Conflict holding the record for manual review, if any.
    pub async fn held_conflict_in(
        conn: &mut SqliteConnection,
        key: &RecordKey,
    ) -> Result<Option<ConflictId>> {
        let held: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT conflict_id FROM sync_queue
            WHERE table_name = ? AND record_id = ? AND status = 'conflict'
            ORDER BY queue_id
            LIMIT 1
            "#,
        )
        .bind(&key.table_name)
        .bind(&key.record_id)
        .fetch_optional(&mut *conn)
        .await?;

        held.and_then(|(id,)| id)
            .map(|id| parse_conflict_id(&id))
            .transpose()
    }
}

async fn load(conn: &mut SqliteConnection, id: QueueId) -> Result<SyncQueueEntry> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sync_queue WHERE queue_id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ClientError::CorruptRow(format!("queue entry {id} not found")))?;
    entry_from_row(&row)
}

async fn save(conn: &mut SqliteConnection, entry: &SyncQueueEntry) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_queue SET
            change_id = ?, version = ?, change = ?, status = ?, attempt_count = ?,
            next_retry_at = ?, conflict_id = ?, last_error = ?, transmitted = ?,
            updated_at = ?
        WHERE queue_id = ?
        "#,
    )
    .bind(entry.change.change_id.to_string())
    .bind(entry.change.version as i64)
    .bind(serde_json::to_string(&entry.change)?)
    .bind(entry.status.as_str())
    .bind(entry.attempt_count as i64)
    .bind(entry.next_retry_at.map(to_millis))
    .bind(entry.conflict_id.map(|id| id.to_string()))
    .bind(&entry.last_error)
    .bind(entry.transmitted)
    .bind(to_millis(entry.updated_at))
    .bind(entry.queue_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn parse_conflict_id(text: &str) -> Result<ConflictId> {
    text.parse()
        .map_err(|_| ClientError::CorruptRow(format!("conflict id {text}")))
}

fn entry_from_row(row: &SqliteRow) -> Result<SyncQueueEntry> {
    let change: String = row.try_get("change")?;
    let status: String = row.try_get("status")?;
    let conflict_id: Option<String> = row.try_get("conflict_id")?;

    Ok(SyncQueueEntry {
        queue_id: row.try_get("queue_id")?,
        change: serde_json::from_str(&change)?,
        status: QueueStatus::parse(&status)
            .ok_or_else(|| ClientError::CorruptRow(format!("queue status {status}")))?,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        next_retry_at: opt_from_millis(row.try_get("next_retry_at")?)?,
        conflict_id: conflict_id.as_deref().map(parse_conflict_id).transpose()?,
        last_error: row.try_get("last_error")?,
        transmitted: row.try_get("transmitted")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_pool, now, run_migrations};
    use serde_json::json;
    use std::time::Duration;
    use tillsync_engine::{ConflictQuery, ConflictType, OpType, TablePayload};

    async fn setup(max_attempts: u32) -> (SyncQueue, ConflictLog) {
        let pool = memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts,
        };
        (
            SyncQueue::new(pool.clone(), policy),
            ConflictLog::new(pool),
        )
    }

    fn change(record: &str, version: u64) -> ChangeRecord {
        let op = if version == 1 {
            OpType::Insert
        } else {
            OpType::Update
        };
        ChangeRecord::new(op, RecordKey::new("products", record), "till-1", version, now())
            .with_payload(TablePayload::new(
                "products",
                json!({"name": format!("{record} v{version}")}),
            ))
    }

    #[tokio::test]
    async fn enqueue_supersedes_pending() {
        let (queue, _) = setup(8).await;
        let first = queue.enqueue(&change("p-1", 1), now()).await.unwrap();
        let other = queue.enqueue(&change("p-2", 1), now()).await.unwrap();
        let second = queue.enqueue(&change("p-1", 2), now()).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        let entries = queue.entries(None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].change.version, 2);
        assert_eq!(entries[0].change.base_version, 0);
        assert_eq!(entries[0].change.op_type, OpType::Insert);
        assert_eq!(queue.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn enqueue_same_change_twice_is_noop() {
        let (queue, _) = setup(8).await;
        let c = change("p-1", 1);
        let a = queue.enqueue(&c, now()).await.unwrap();
        let b = queue.enqueue(&c, now()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.entries(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_flight_entries_are_not_superseded() {
        let (queue, _) = setup(8).await;
        queue.enqueue(&change("p-1", 1), now()).await.unwrap();
        let batch = queue.dequeue_batch(10, now()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, QueueStatus::Sent);

        queue.enqueue(&change("p-1", 2), now()).await.unwrap();
        let entries = queue.entries(None).await.unwrap();
        assert_eq!(entries.len(), 2);

        // the newer entry waits behind the in-flight one
        assert!(queue.dequeue_batch(10, now()).await.unwrap().is_empty());

        queue.ack(&[batch[0].queue_id], now()).await.unwrap();
        let next = queue.dequeue_batch(10, now()).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].change.version, 2);
        assert_eq!(next[0].change.base_version, 1);
    }

    #[tokio::test]
    async fn transmitted_entries_keep_later_edits_separate() {
        let (queue, _) = setup(8).await;
        let failed = queue.enqueue(&change("p-1", 2), now()).await.unwrap();
        let crashed = queue.enqueue(&change("p-2", 2), now()).await.unwrap();
        queue.dequeue_batch(10, now()).await.unwrap();
        queue.fail(failed, "response lost", now()).await.unwrap();
        assert_eq!(queue.recover_in_flight(now()).await.unwrap(), 1);

        let recovered = queue.get(crashed).await.unwrap().unwrap();
        assert_eq!(recovered.status, QueueStatus::Pending);
        assert!(recovered.transmitted);

        let after_failed = queue.enqueue(&change("p-1", 3), now()).await.unwrap();
        let after_crashed = queue.enqueue(&change("p-2", 3), now()).await.unwrap();
        assert_ne!(after_failed, failed);
        assert_ne!(after_crashed, crashed);

        let entries = queue.entries(None).await.unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(queue.get(failed).await.unwrap().unwrap().change.version, 2);
        let queued = queue.get(after_failed).await.unwrap().unwrap();
        assert_eq!(queued.change.base_version, 2);
        assert!(!queued.transmitted);
    }

    #[tokio::test]
    async fn fail_backs_off_then_abandons_with_log_entry() {
        let (queue, log) = setup(2).await;
        let id = queue.enqueue(&change("p-1", 1), now()).await.unwrap();

        let t0 = now();
        queue.dequeue_batch(10, t0).await.unwrap();
        let decision = queue.fail(id, "network error: timed out", t0).await.unwrap();
        assert!(matches!(decision, RetryDecision::Retry { .. }));
        assert!(queue.dequeue_batch(10, t0).await.unwrap().is_empty());

        let later = t0 + chrono::Duration::seconds(3);
        assert_eq!(queue.dequeue_batch(10, later).await.unwrap().len(), 1);
        let decision = queue.fail(id, "network error: timed out", later).await.unwrap();
        assert_eq!(decision, RetryDecision::Abandon);

        let entry = queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Abandoned);
        assert_eq!(queue.abandoned_count().await.unwrap(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);

        let failures = log.list(&ConflictQuery::new()).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].conflict_type, ConflictType::SyncFailure);
        assert!(failures[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("exceeded 2 attempts"));
    }

    #[tokio::test]
    async fn recover_in_flight_resets_sent() {
        let (queue, _) = setup(8).await;
        queue.enqueue(&change("p-1", 1), now()).await.unwrap();
        queue.enqueue(&change("p-2", 1), now()).await.unwrap();
        queue.dequeue_batch(10, now()).await.unwrap();

        assert_eq!(queue.recover_in_flight(now()).await.unwrap(), 2);
        assert_eq!(queue.entries(Some(QueueStatus::Pending)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn hold_and_release() {
        let (queue, _) = setup(8).await;
        let id = queue.enqueue(&change("p-1", 2), now()).await.unwrap();
        queue.dequeue_batch(10, now()).await.unwrap();

        let conflict_id = uuid::Uuid::new_v4();
        let mut conn = queue.pool.acquire().await.unwrap();
        SyncQueue::hold_in(&mut conn, id, conflict_id, now()).await.unwrap();
        let key = RecordKey::new("products", "p-1");
        assert_eq!(
            SyncQueue::held_conflict_in(&mut conn, &key).await.unwrap(),
            Some(conflict_id)
        );

        assert_eq!(SyncQueue::release_in(&mut conn, conflict_id, now()).await.unwrap(), 1);
        assert_eq!(SyncQueue::held_conflict_in(&mut conn, &key).await.unwrap(), None);
        assert!(!SyncQueue::has_unsettled_in(&mut conn, &key).await.unwrap());
        drop(conn);

        assert_eq!(queue.get(id).await.unwrap().unwrap().status, QueueStatus::Acked);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (queue, _) = setup(8).await;
        let id = queue.enqueue(&change("p-1", 1), now()).await.unwrap();
        let err = queue.ack(&[id], now()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Engine(tillsync_engine::Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn purge_acked_entries() {
        let (queue, _) = setup(8).await;
        let id = queue.enqueue(&change("p-1", 1), now()).await.unwrap();
        queue.dequeue_batch(10, now()).await.unwrap();
        queue.ack(&[id], now()).await.unwrap();

        let purged = queue
            .purge_acked(now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(queue.entries(None).await.unwrap().is_empty());
    }
}

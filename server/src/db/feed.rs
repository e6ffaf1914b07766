//! Processed-change ledger and the sequenced change feed.

use super::to_u64;
use crate::error::AppError;
use sqlx::{PgConnection, PgPool, Row};
use tillsync_engine::{ChangeId, ChangeRecord, ChangeResult, FeedEntry, RemoteChange, Sequence};

/// Advisory lock key serializing feed appends. Sequence numbers become
/// visible in commit order, so a pull never skips a late-committing entry.
const FEED_LOCK: i64 = 0x7469_6c6c_6665_6564;

/// Result of an already processed change, if any.
pub async fn processed_result(
    conn: &mut PgConnection,
    change_id: ChangeId,
) -> Result<Option<ChangeResult>, AppError> {
    let row = sqlx::query("SELECT result FROM processed_changes WHERE change_id = $1")
        .bind(change_id)
        .fetch_optional(conn)
        .await?;

    match row {
        Some(row) => {
            let value: serde_json::Value = row.try_get("result")?;
            Ok(Some(serde_json::from_value(value)?))
        }
        None => Ok(None),
    }
}

/// Remember the answer given for a change.
pub async fn record_processed(
    conn: &mut PgConnection,
    change: &ChangeRecord,
    result: &ChangeResult,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO processed_changes (change_id, device_id, table_name, record_id, result)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(change.change_id)
    .bind(&change.device_id)
    .bind(&change.table_name)
    .bind(&change.record_id)
    .bind(serde_json::to_value(result)?)
    .execute(conn)
    .await?;

    Ok(())
}

/// Append to the change feed and return the assigned sequence.
pub async fn append_feed(
    conn: &mut PgConnection,
    entry: &FeedEntry,
) -> Result<Sequence, AppError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(FEED_LOCK)
        .execute(&mut *conn)
        .await?;

    let (sequence,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO change_feed (table_name, record_id, change, reason)
        VALUES ($1, $2, $3, $4)
        RETURNING sequence
        "#,
    )
    .bind(&entry.change.table_name)
    .bind(&entry.change.record_id)
    .bind(serde_json::to_value(&entry.change)?)
    .bind(serde_json::to_value(entry.reason)?)
    .fetch_one(conn)
    .await?;

    Ok(to_u64(sequence))
}

/// Feed entries after `since`, oldest first.
pub async fn feed_since(
    pool: &PgPool,
    since: Sequence,
    limit: usize,
) -> Result<Vec<RemoteChange>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT sequence, change, reason
        FROM change_feed
        WHERE sequence > $1
        ORDER BY sequence ASC
        LIMIT $2
        "#,
    )
    .bind(since as i64)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut changes = Vec::with_capacity(rows.len());
    for row in rows {
        let sequence: i64 = row.try_get("sequence")?;
        let change: serde_json::Value = row.try_get("change")?;
        let reason: serde_json::Value = row.try_get("reason")?;
        changes.push(RemoteChange {
            sequence: to_u64(sequence),
            change: serde_json::from_value(change)?,
            reason: serde_json::from_value(reason)?,
        });
    }
    Ok(changes)
}

/// Highest sequence in the feed, 0 when empty.
pub async fn latest_sequence(pool: &PgPool) -> Result<Sequence, sqlx::Error> {
    let (sequence,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM change_feed")
        .fetch_one(pool)
        .await?;
    Ok(to_u64(sequence))
}

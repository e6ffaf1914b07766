//! Local SQLite store: pool setup, migrations, and the synced-row table.

use crate::error::{ClientError, Result};
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::{str::FromStr, time::Duration};
use tillsync_engine::{RecordKey, StoredRecord, TablePayload, Timestamp, Version};

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Create a pool over a file-backed store, creating the file if needed.
pub async fn create_pool(database_url: &str) -> Result<Pool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?)
}

/// A single-connection in-memory store that lives as long as the pool.
pub async fn memory_pool() -> Result<Pool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?)
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Current time, truncated to the millisecond precision the store keeps.
pub fn now() -> Timestamp {
    let millis = Utc::now().timestamp_millis();
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

pub fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(millis: i64) -> Result<Timestamp> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ClientError::CorruptRow(format!("timestamp out of range: {millis}")))
}

pub fn opt_from_millis(millis: Option<i64>) -> Result<Option<Timestamp>> {
    millis.map(from_millis).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<StoredRecord> {
    let table_name: String = row.try_get("table_name")?;
    let payload = row
        .try_get::<Option<String>, _>("payload")?
        .map(|text| serde_json::from_str(&text))
        .transpose()?
        .map(|data| TablePayload::new(table_name.clone(), data));

    Ok(StoredRecord {
        record_id: row.try_get("record_id")?,
        version: row.try_get::<i64, _>("version")? as u64,
        last_modified: from_millis(row.try_get("last_modified")?)?,
        device_id: row.try_get("device_id")?,
        user_id: row.try_get("user_id")?,
        deleted: row.try_get("deleted")?,
        payload,
        table_name,
    })
}

/// Load a synced row, including tombstones.
pub async fn load_record(
    conn: &mut SqliteConnection,
    key: &RecordKey,
) -> Result<Option<StoredRecord>> {
    let row = sqlx::query(
        r#"
        SELECT table_name, record_id, version, last_modified, device_id,
               user_id, deleted, payload
        FROM records
        WHERE table_name = ? AND record_id = ?
        "#,
    )
    .bind(&key.table_name)
    .bind(&key.record_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Insert or replace a synced row.
pub async fn upsert_record(conn: &mut SqliteConnection, record: &StoredRecord) -> Result<()> {
    let payload = record
        .payload
        .as_ref()
        .map(|p| serde_json::to_string(&p.data))
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO records (
            table_name, record_id, version, last_modified, device_id,
            user_id, deleted, payload
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (table_name, record_id) DO UPDATE SET
            version = excluded.version,
            last_modified = excluded.last_modified,
            device_id = excluded.device_id,
            user_id = excluded.user_id,
            deleted = excluded.deleted,
            payload = excluded.payload
        "#,
    )
    .bind(&record.table_name)
    .bind(&record.record_id)
    .bind(record.version as i64)
    .bind(to_millis(record.last_modified))
    .bind(&record.device_id)
    .bind(&record.user_id)
    .bind(record.deleted)
    .bind(payload)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Cloud version the local row last matched; 0 when the cloud has never
/// confirmed it.
pub async fn synced_version(conn: &mut SqliteConnection, key: &RecordKey) -> Result<Version> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT synced_version FROM records WHERE table_name = ? AND record_id = ?",
    )
    .bind(&key.table_name)
    .bind(&key.record_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map_or(0, |(version,)| version.max(0) as Version))
}

/// Record that the cloud holds `version` of the row.
pub async fn set_synced_version(
    conn: &mut SqliteConnection,
    key: &RecordKey,
    version: Version,
) -> Result<()> {
    sqlx::query("UPDATE records SET synced_version = ? WHERE table_name = ? AND record_id = ?")
        .bind(version as i64)
        .bind(&key.table_name)
        .bind(&key.record_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// All live rows of a table.
pub async fn active_records(pool: &Pool, table: &str) -> Result<Vec<StoredRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT table_name, record_id, version, last_modified, device_id,
               user_id, deleted, payload
        FROM records
        WHERE table_name = ? AND deleted = 0
        ORDER BY record_id
        "#,
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

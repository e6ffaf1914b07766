//! Database operations for the records table.

use super::to_u64;
use sqlx::{PgConnection, PgPool, Row};
use tillsync_engine::{RecordKey, StoredRecord, TablePayload, Timestamp};

/// A stored record row from the database.
#[derive(Debug)]
pub struct RecordRow {
    pub table_name: String,
    pub record_id: String,
    pub version: i64,
    pub last_modified: Timestamp,
    pub device_id: String,
    pub user_id: Option<String>,
    pub deleted: bool,
    pub payload: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RecordRow {
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            version: row.try_get("version")?,
            last_modified: row.try_get("last_modified")?,
            device_id: row.try_get("device_id")?,
            user_id: row.try_get("user_id")?,
            deleted: row.try_get("deleted")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl RecordRow {
    /// Convert database row to an engine record.
    pub fn into_record(self) -> StoredRecord {
        let payload = self
            .payload
            .map(|data| TablePayload::new(self.table_name.clone(), data));
        StoredRecord {
            table_name: self.table_name,
            record_id: self.record_id,
            version: to_u64(self.version),
            last_modified: self.last_modified,
            device_id: self.device_id,
            user_id: self.user_id,
            deleted: self.deleted,
            payload,
        }
    }
}

/// Serialize writers of one record until the surrounding transaction ends.
pub async fn lock_record(conn: &mut PgConnection, key: &RecordKey) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

/// Insert or replace the authoritative state of a record.
pub async fn upsert_record(
    conn: &mut PgConnection,
    record: &StoredRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO records (
            table_name, record_id, version, last_modified, device_id,
            user_id, deleted, payload
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (table_name, record_id) DO UPDATE SET
            version = EXCLUDED.version,
            last_modified = EXCLUDED.last_modified,
            device_id = EXCLUDED.device_id,
            user_id = EXCLUDED.user_id,
            deleted = EXCLUDED.deleted,
            payload = EXCLUDED.payload,
            updated_at = NOW()
        "#,
    )
    .bind(&record.table_name)
    .bind(&record.record_id)
    .bind(record.version as i64)
    .bind(record.last_modified)
    .bind(&record.device_id)
    .bind(&record.user_id)
    .bind(record.deleted)
    .bind(record.payload.as_ref().map(|p| &p.data))
    .execute(conn)
    .await?;

    Ok(())
}

/// Get a record by table and ID.
pub async fn get_record(
    conn: &mut PgConnection,
    key: &RecordKey,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        SELECT table_name, record_id, version, last_modified, device_id,
               user_id, deleted, payload
        FROM records
        WHERE table_name = $1 AND record_id = $2
        "#,
    )
    .bind(&key.table_name)
    .bind(&key.record_id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(RecordRow::into_record))
}

/// Number of live (not deleted) records.
pub async fn active_count(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE NOT deleted")
        .fetch_one(pool)
        .await?;
    Ok(to_u64(count))
}

//! Device-side mirror of the conflict log.
//!
//! Every conflict entry returned in upload results is mirrored here, next to
//! the device's own `sync_failure` entries, so conflicts can be listed while
//! offline.

use crate::db::{from_millis, opt_from_millis, to_millis, Pool};
use crate::error::{ClientError, Result};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection};
use tillsync_engine::{
    ConflictId, ConflictLogEntry, ConflictQuery, ConflictType, Resolution, Side, TablePayload,
    Timestamp,
};

const COLUMNS: &str = "conflict_id, table_name, record_id, device_id, conflict_type, \
    local_version, remote_version, local_data, remote_data, resolution, resolved_by, \
    resolved_at, winner, error_message, created_at";

/// Append-only conflict store.
#[derive(Debug, Clone)]
pub struct ConflictLog {
    pool: Pool,
}

impl ConflictLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Record an entry. Mirroring the same entry again only refreshes its
    /// resolution fields.
    pub async fn append_in(conn: &mut SqliteConnection, entry: &ConflictLogEntry) -> Result<()> {
        let local_data = payload_text(entry.local_data.as_ref())?;
        let remote_data = payload_text(entry.remote_data.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                conflict_id, table_name, record_id, device_id, conflict_type,
                local_version, remote_version, local_data, remote_data, resolution,
                resolved_by, resolved_at, winner, error_message, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (conflict_id) DO UPDATE SET
                resolved_by = COALESCE(conflict_log.resolved_by, excluded.resolved_by),
                resolved_at = COALESCE(conflict_log.resolved_at, excluded.resolved_at),
                winner = COALESCE(conflict_log.winner, excluded.winner)
            "#,
        )
        .bind(entry.conflict_id.to_string())
        .bind(&entry.table_name)
        .bind(&entry.record_id)
        .bind(&entry.device_id)
        .bind(entry.conflict_type.as_str())
        .bind(entry.local_version as i64)
        .bind(entry.remote_version as i64)
        .bind(local_data)
        .bind(remote_data)
        .bind(entry.resolution.as_str())
        .bind(&entry.resolved_by)
        .bind(entry.resolved_at.map(to_millis))
        .bind(entry.winner.map(|w| w.as_str()))
        .bind(&entry.error_message)
        .bind(to_millis(entry.created_at))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn append(&self, entry: &ConflictLogEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::append_in(&mut conn, entry).await
    }

    /// Set resolution fields of a mirrored entry that are still empty.
    pub async fn mark_resolved_in(
        conn: &mut SqliteConnection,
        conflict_id: ConflictId,
        winner: Option<Side>,
        resolved_by: &str,
        resolved_at: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conflict_log
            SET resolved_by = ?, resolved_at = ?, winner = COALESCE(?, winner)
            WHERE conflict_id = ? AND resolved_at IS NULL
            "#,
        )
        .bind(resolved_by)
        .bind(to_millis(resolved_at))
        .bind(winner.map(|w| w.as_str()))
        .bind(conflict_id.to_string())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, conflict_id: ConflictId) -> Result<Option<ConflictLogEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM conflict_log WHERE conflict_id = ?"
        ))
        .bind(conflict_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// List entries matching the filter, oldest first.
    pub async fn list(&self, query: &ConflictQuery) -> Result<Vec<ConflictLogEntry>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM conflict_log WHERE 1 = 1"));

        if let Some(table) = &query.table {
            builder.push(" AND table_name = ").push_bind(table.clone());
        }
        if let Some(resolution) = query.resolution {
            builder
                .push(" AND resolution = ")
                .push_bind(resolution.as_str());
        }
        match query.open {
            Some(true) => {
                builder.push(" AND resolution = 'manual_review' AND resolved_at IS NULL");
            }
            Some(false) => {
                builder.push(" AND NOT (resolution = 'manual_review' AND resolved_at IS NULL)");
            }
            None => {}
        }
        if let Some(since) = query.since {
            builder.push(" AND created_at >= ").push_bind(to_millis(since));
        }
        if let Some(until) = query.until {
            builder.push(" AND created_at < ").push_bind(to_millis(until));
        }
        builder.push(" ORDER BY created_at, rowid");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Number of manual-review entries still awaiting an operator.
    pub async fn open_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM conflict_log
            WHERE resolution = 'manual_review' AND resolved_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }
}

fn payload_text(payload: Option<&TablePayload>) -> Result<Option<String>> {
    Ok(payload.map(|p| serde_json::to_string(&p.data)).transpose()?)
}

fn payload_from(table: &str, text: Option<String>) -> Result<Option<TablePayload>> {
    Ok(text
        .map(|t| serde_json::from_str(&t))
        .transpose()?
        .map(|data| TablePayload::new(table, data)))
}

fn entry_from_row(row: &SqliteRow) -> Result<ConflictLogEntry> {
    let conflict_id: String = row.try_get("conflict_id")?;
    let table_name: String = row.try_get("table_name")?;
    let conflict_type: String = row.try_get("conflict_type")?;
    let resolution: String = row.try_get("resolution")?;
    let winner: Option<String> = row.try_get("winner")?;

    Ok(ConflictLogEntry {
        conflict_id: conflict_id
            .parse()
            .map_err(|_| ClientError::CorruptRow(format!("conflict id {conflict_id}")))?,
        record_id: row.try_get("record_id")?,
        device_id: row.try_get("device_id")?,
        conflict_type: ConflictType::parse(&conflict_type)
            .ok_or_else(|| ClientError::CorruptRow(format!("conflict type {conflict_type}")))?,
        local_version: row.try_get::<i64, _>("local_version")? as u64,
        remote_version: row.try_get::<i64, _>("remote_version")? as u64,
        local_data: payload_from(&table_name, row.try_get("local_data")?)?,
        remote_data: payload_from(&table_name, row.try_get("remote_data")?)?,
        resolution: Resolution::parse(&resolution)
            .ok_or_else(|| ClientError::CorruptRow(format!("resolution {resolution}")))?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: opt_from_millis(row.try_get("resolved_at")?)?,
        winner: winner.as_deref().and_then(Side::parse),
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        table_name,
    })
}

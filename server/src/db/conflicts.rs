//! The cloud's conflict log.

use super::to_u64;
use crate::error::{AppError, Result};
use sqlx::{postgres::PgRow, PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tillsync_engine::{
    ConflictId, ConflictLogEntry, ConflictQuery, ConflictType, Resolution, Side, TablePayload,
};

const COLUMNS: &str = "conflict_id, table_name, record_id, device_id, conflict_type, \
    local_version, remote_version, local_data, remote_data, resolution, resolved_by, \
    resolved_at, winner, error_message, created_at";

pub async fn insert_conflict(conn: &mut PgConnection, entry: &ConflictLogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conflict_log (
            conflict_id, table_name, record_id, device_id, conflict_type,
            local_version, remote_version, local_data, remote_data, resolution,
            resolved_by, resolved_at, winner, error_message, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(entry.conflict_id)
    .bind(&entry.table_name)
    .bind(&entry.record_id)
    .bind(&entry.device_id)
    .bind(entry.conflict_type.as_str())
    .bind(entry.local_version as i64)
    .bind(entry.remote_version as i64)
    .bind(entry.local_data.as_ref().map(|p| &p.data))
    .bind(entry.remote_data.as_ref().map(|p| &p.data))
    .bind(entry.resolution.as_str())
    .bind(&entry.resolved_by)
    .bind(entry.resolved_at)
    .bind(entry.winner.map(|w| w.as_str()))
    .bind(&entry.error_message)
    .bind(entry.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Load an entry and lock its row for the rest of the transaction.
pub async fn conflict_for_update(
    conn: &mut PgConnection,
    conflict_id: ConflictId,
) -> Result<Option<ConflictLogEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM conflict_log WHERE conflict_id = $1 FOR UPDATE"
    ))
    .bind(conflict_id)
    .fetch_optional(conn)
    .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Persist the resolution fields of an entry.
pub async fn update_resolution(conn: &mut PgConnection, entry: &ConflictLogEntry) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE conflict_log
        SET resolved_by = $2, resolved_at = $3, winner = $4, error_message = $5
        WHERE conflict_id = $1
        "#,
    )
    .bind(entry.conflict_id)
    .bind(&entry.resolved_by)
    .bind(entry.resolved_at)
    .bind(entry.winner.map(|w| w.as_str()))
    .bind(&entry.error_message)
    .execute(conn)
    .await?;

    Ok(())
}

/// Entries matching the filter, oldest first.
pub async fn list_conflicts(pool: &PgPool, query: &ConflictQuery) -> Result<Vec<ConflictLogEntry>> {
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("SELECT {COLUMNS} FROM conflict_log WHERE TRUE"));

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
        builder.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = query.until {
        builder.push(" AND created_at < ").push_bind(until);
    }
    builder.push(" ORDER BY created_at, conflict_id");
    if let Some(limit) = query.limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &PgRow) -> Result<ConflictLogEntry> {
    let table_name: String = row.try_get("table_name")?;
    let conflict_type: String = row.try_get("conflict_type")?;
    let resolution: String = row.try_get("resolution")?;
    let winner: Option<String> = row.try_get("winner")?;
    let payload = |column: &str| -> Result<Option<TablePayload>> {
        let data: Option<serde_json::Value> = row.try_get(column)?;
        Ok(data.map(|d| TablePayload::new(table_name.clone(), d)))
    };

    Ok(ConflictLogEntry {
        conflict_id: row.try_get("conflict_id")?,
        record_id: row.try_get("record_id")?,
        device_id: row.try_get("device_id")?,
        conflict_type: ConflictType::parse(&conflict_type)
            .ok_or_else(|| AppError::Internal(format!("unknown conflict type {conflict_type}")))?,
        local_version: to_u64(row.try_get("local_version")?),
        remote_version: to_u64(row.try_get("remote_version")?),
        local_data: payload("local_data")?,
        remote_data: payload("remote_data")?,
        resolution: Resolution::parse(&resolution)
            .ok_or_else(|| AppError::Internal(format!("unknown resolution {resolution}")))?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: row.try_get("resolved_at")?,
        winner: winner.as_deref().and_then(Side::parse),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        table_name,
    })
}

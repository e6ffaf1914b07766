//! Conflict log listing and manual resolution.

use crate::db;
use crate::error::{AppError, Result};
use sqlx::PgPool;
use tillsync_engine::{
    ConflictId, ConflictLogEntry, ConflictQuery, Error, ResolveRequest, ResolveResponse,
    Resolver, Schema,
};

pub async fn handle_list_conflicts(
    pool: &PgPool,
    query: &ConflictQuery,
) -> Result<Vec<ConflictLogEntry>> {
    db::list_conflicts(pool, query).await
}

/// Settle a held conflict with the side an operator picked.
///
/// The chosen payload becomes a new version and is announced on the feed so
/// every device converges, including the one whose edit was held.
pub async fn handle_resolve(
    pool: &PgPool,
    schema: &Schema,
    conflict_id: ConflictId,
    request: ResolveRequest,
) -> Result<ResolveResponse> {
    let resolver = request.resolver.trim();
    if resolver.is_empty() {
        return Err(AppError::BadRequest("resolver is required".to_string()));
    }

    let mut tx = pool.begin().await?;
    let mut entry = db::conflict_for_update(&mut tx, conflict_id)
        .await?
        .ok_or(Error::ConflictNotFound(conflict_id))?;

    let key = entry.key();
    db::lock_record(&mut tx, &key).await?;
    let current = db::get_record(&mut tx, &key).await?;

    let (record, feed) = Resolver::new(schema).resolve_manual(
        &mut entry,
        request.side,
        resolver,
        current.as_ref(),
        db::now(),
    )?;

    db::upsert_record(&mut tx, &record).await?;
    db::update_resolution(&mut tx, &entry).await?;
    let sequence = db::append_feed(&mut tx, &feed).await?;
    tx.commit().await?;

    tracing::info!(
        %conflict_id,
        record = %key,
        side = %request.side,
        resolver,
        version = record.version,
        sequence,
        "conflict resolved"
    );

    Ok(ResolveResponse {
        conflict: entry,
        record,
    })
}

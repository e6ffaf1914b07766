//! Batch handler - runs uploaded changes through the conflict resolver.

use crate::db;
use crate::error::Result;
use sqlx::PgPool;
use tillsync_engine::{
    BatchRequest, BatchResponse, ChangeRecord, ChangeResult, Error, Resolver, Schema, Timestamp,
};

/// Process an uploaded batch.
///
/// The schema version and every change are checked up front so a bad batch
/// is refused before any record is touched. Each change then commits on its
/// own: a failure partway leaves the earlier changes applied, and the device
/// resends the whole batch, which the processed ledger answers from memory.
pub async fn handle_batch(
    pool: &PgPool,
    schema: &Schema,
    request: BatchRequest,
) -> Result<BatchResponse> {
    if request.schema_version != schema.version {
        return Err(Error::SchemaMismatch {
            local: request.schema_version,
            remote: schema.version,
        }
        .into());
    }
    for change in &request.changes {
        schema.validate_change(change)?;
    }

    let mut results = Vec::with_capacity(request.changes.len());
    for change in &request.changes {
        results.push(apply_change(pool, schema, change, db::now()).await?);
    }

    let conflicts = results.iter().filter(|r| !r.is_applied()).count();
    tracing::info!(
        device_id = %request.device_id,
        changes = results.len(),
        conflicts,
        "batch processed"
    );

    Ok(BatchResponse { results })
}

/// Resolve and persist one change, idempotently by `change_id`.
pub async fn apply_change(
    pool: &PgPool,
    schema: &Schema,
    change: &ChangeRecord,
    now: Timestamp,
) -> Result<ChangeResult> {
    let key = change.key();
    let mut tx = pool.begin().await?;
    db::lock_record(&mut tx, &key).await?;

    if let Some(result) = db::processed_result(&mut tx, change.change_id).await? {
        tx.commit().await?;
        tracing::debug!(change_id = %change.change_id, record = %key, "redelivered change");
        return Ok(result);
    }

    let current = db::get_record(&mut tx, &key).await?;
    let outcome = Resolver::new(schema).resolve(change, current.as_ref(), now)?;

    if let Some(record) = &outcome.write {
        db::upsert_record(&mut tx, record).await?;
    }
    if let Some(entry) = &outcome.conflict {
        db::insert_conflict(&mut tx, entry).await?;
        tracing::warn!(
            table = %entry.table_name,
            record_id = %entry.record_id,
            conflict_id = %entry.conflict_id,
            device_id = %entry.device_id,
            resolution = %entry.resolution,
            "conflict recorded"
        );
    }
    if let Some(feed) = &outcome.feed {
        let sequence = db::append_feed(&mut tx, feed).await?;
        tracing::debug!(record = %key, sequence, "feed entry appended");
    }
    db::record_processed(&mut tx, change, &outcome.result).await?;
    tx.commit().await?;

    Ok(outcome.result)
}

//! Pull handler - pages through the change feed.

use crate::db;
use crate::error::Result;
use sqlx::PgPool;
use tillsync_engine::{PullQuery, PullResponse};

/// Serve the feed entries after `query.since`.
pub async fn handle_pull(
    pool: &PgPool,
    limit_max: usize,
    query: PullQuery,
) -> Result<PullResponse> {
    let limit = query.effective_limit(limit_max);

    // Fetch one more than requested to check if there are more
    let mut changes = db::feed_since(pool, query.since, limit + 1).await?;
    let has_more = changes.len() > limit;
    changes.truncate(limit);

    let next_seq = changes.last().map_or(query.since, |c| c.sequence);
    Ok(PullResponse {
        changes,
        next_seq,
        has_more,
    })
}

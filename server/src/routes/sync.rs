//! Sync endpoint routes.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use tillsync_engine::{
    BatchRequest, BatchResponse, ConflictId, ConflictLogEntry, ConflictQuery, PullQuery,
    PullResponse, ResolveRequest, ResolveResponse, SchemaInfo,
};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_batch, handle_list_conflicts, handle_pull, handle_resolve};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/schema", get(schema_handler))
        .route("/sync/batch", post(batch_handler))
        .route("/sync/pull", get(pull_handler))
        .route("/sync/conflicts", get(conflicts_handler))
        .route("/sync/conflicts/{id}/resolve", post(resolve_handler))
}

/// GET /sync/schema - Schema version the cloud accepts.
async fn schema_handler(State(state): State<AppState>, _auth: AuthUser) -> Json<SchemaInfo> {
    Json(SchemaInfo {
        schema_version: state.schema.version,
    })
}

/// POST /sync/batch - Upload changes.
async fn batch_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    tracing::debug!(
        device_id = %request.device_id,
        changes = request.changes.len(),
        anonymous = auth.is_anonymous(),
        "batch received"
    );
    let response = handle_batch(&state.pool, &state.schema, request).await?;
    Ok(Json(response))
}

/// GET /sync/pull - Page through the change feed.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.pool, state.config.pull_limit_max, query).await?;
    Ok(Json(response))
}

/// GET /sync/conflicts - List the conflict log.
async fn conflicts_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<Vec<ConflictLogEntry>>> {
    let entries = handle_list_conflicts(&state.pool, &query).await?;
    Ok(Json(entries))
}

/// POST /sync/conflicts/{id}/resolve - Settle a held conflict.
async fn resolve_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(conflict_id): Path<ConflictId>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>> {
    let response = handle_resolve(&state.pool, &state.schema, conflict_id, request).await?;
    Ok(Json(response))
}

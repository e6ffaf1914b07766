//! Liveness endpoint.
//!
//! Always answers 200 while the process is up. The body says whether the
//! database answered and how far the change feed has advanced.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::time::Duration;
use tillsync_engine::{SchemaVersion, Sequence};

use crate::{db, AppState};

const DATABASE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the database did not answer
    pub status: &'static str,
    pub version: &'static str,
    pub schema_version: SchemaVersion,
    /// Latest change-feed sequence; absent when the database is unreachable
    pub feed_head: Option<Sequence>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let probe = tokio::time::timeout(DATABASE_PROBE_TIMEOUT, db::latest_sequence(&state.pool));
    let feed_head = match probe.await {
        Ok(Ok(sequence)) => Some(sequence),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "health check could not read the change feed");
            None
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = DATABASE_PROBE_TIMEOUT.as_millis() as u64,
                "health check timed out waiting for the database"
            );
            None
        }
    };

    Json(HealthResponse {
        status: if feed_head.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        schema_version: state.schema.version,
        feed_head,
    })
}

async fn root() -> &'static str {
    "Tillsync Cloud"
}

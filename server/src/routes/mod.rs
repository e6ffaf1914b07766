//! HTTP route definitions.

mod health;
mod sync;

use crate::AppState;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// The full application: routes, middleware and state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}

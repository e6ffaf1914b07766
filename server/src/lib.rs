//! # Tillsync Server
//!
//! The cloud side of tillsync. Terminals upload batches of versioned changes;
//! every change runs through the engine's conflict resolver inside its own
//! PostgreSQL transaction. Accepted writes and conflict outcomes land on a
//! sequenced change feed that devices pull to converge, and held conflicts
//! wait in the conflict log until an operator resolves them.
//!
//! Endpoints:
//!
//! | Method | Path | |
//! |---|---|---|
//! | `GET` | `/sync/schema` | accepted schema version |
//! | `POST` | `/sync/batch` | upload changes |
//! | `GET` | `/sync/pull?since=&limit=` | change feed page |
//! | `GET` | `/sync/conflicts` | conflict log |
//! | `POST` | `/sync/conflicts/{id}/resolve` | settle a held conflict |
//! | `GET` | `/health` | liveness |

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;

use crate::config::Config;
use crate::db::Pool;
use std::sync::Arc;
use tillsync_engine::Schema;

pub use error::{AppError, Result};
pub use routes::router;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    /// Schema the cloud accepts
    pub schema: Arc<Schema>,
}

impl AppState {
    pub fn new(pool: Pool, config: Config, schema: Schema) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            schema: Arc::new(schema),
        }
    }
}

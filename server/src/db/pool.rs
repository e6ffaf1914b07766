//! Connection pool and migrations.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub type Pool = PgPool;

const MAX_CONNECTIONS: u32 = 10;

/// Connect to PostgreSQL.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    options().connect(database_url).await
}

/// A pool that only connects on first use.
pub fn lazy_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    options().connect_lazy(database_url)
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

fn options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(5))
}

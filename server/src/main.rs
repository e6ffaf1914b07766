//! Tillsync Server - cloud sync service for point-of-sale terminals.

use tillsync_server::config::Config;
use tillsync_server::{db, router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tillsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let schema = config.load_schema()?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        schema_version = schema.version,
        tables = schema.tables.len(),
        auth = config.auth_secret.is_some(),
        "starting tillsync server"
    );

    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("running database migrations");
    db::run_migrations(&pool).await?;

    let addr = format!("{}:{}", config.host, config.port);
    let app = router(AppState::new(pool, config, schema));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

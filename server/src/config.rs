//! Configuration management for the server.

use std::env;
use std::path::PathBuf;
use tillsync_engine::{Schema, MAX_PULL_LIMIT};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Shared device API key; anonymous access when unset
    pub auth_secret: Option<String>,
    /// JSON schema file; the built-in retail schema when unset
    pub schema_file: Option<PathBuf>,
    /// Largest page a pull may ask for
    pub pull_limit_max: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());
        let schema_file = env::var("SCHEMA_FILE").ok().map(PathBuf::from);

        let pull_limit_max = match env::var("PULL_LIMIT_MAX") {
            Ok(value) => value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidPullLimit(value))?,
            Err(_) => MAX_PULL_LIMIT,
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            schema_file,
            pull_limit_max,
        })
    }

    /// Configuration for tests and embedding, with everything but the
    /// database defaulted.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_url: database_url.into(),
            auth_secret: None,
            schema_file: None,
            pull_limit_max: MAX_PULL_LIMIT,
        }
    }

    /// The schema the cloud accepts.
    pub fn load_schema(&self) -> Result<Schema, ConfigError> {
        let Some(path) = &self.schema_file else {
            return Ok(Schema::retail());
        };
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::SchemaFile {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::SchemaFile {
            path: path.clone(),
            reason: e.to_string(),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid PULL_LIMIT_MAX value: {0}")]
    InvalidPullLimit(String),

    #[error("Cannot load schema from {path:?}: {reason}")]
    SchemaFile { path: PathBuf, reason: String },
}

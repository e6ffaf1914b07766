//! Error handling for the device client.

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] tillsync_engine::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cloud rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Corrupt local row: {0}")]
    CorruptRow(String),

    #[error("Sync is disabled")]
    Disabled,
}

impl ClientError {
    /// Whether the failure is transient and the work should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Engine(e) => e.is_retryable(),
            ClientError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The cloud refused the device's schema.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(
            self,
            ClientError::Engine(tillsync_engine::Error::SchemaMismatch { .. })
                | ClientError::Rejected { status: 409, .. }
        )
    }

    /// Another process holds the sync lease.
    pub fn is_lock_held(&self) -> bool {
        matches!(
            self,
            ClientError::Engine(tillsync_engine::Error::SyncLockHeld { .. })
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        ClientError::Engine(tillsync_engine::Error::Network(message.into()))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Rejected {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        } else {
            ClientError::network(e.to_string())
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

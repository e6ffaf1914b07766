//! Configuration management for the device client.

use std::{env, time::Duration};
use tillsync_engine::{DeviceId, RetryPolicy};

/// Largest batch a device may upload in one request.
pub const MAX_BATCH_SIZE: usize = 500;

/// Device configuration, usually loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Unique terminal identifier
    pub device_id: DeviceId,
    /// SQLite connection URL of the local store
    pub database_url: String,
    /// Base URL of the cloud service (`None` keeps the device offline)
    pub server_url: Option<String>,
    /// Bearer token sent to the cloud service
    pub api_key: Option<String>,
    /// Master switch for background and manual sync
    pub sync_enabled: bool,
    /// Queue entries uploaded per batch (clamped to `1..=500`)
    pub batch_size: usize,
    /// Failed attempts before an entry is abandoned
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Per-call transport timeout
    pub request_timeout: Duration,
    /// Quiet period after the last local write before an idle sync
    pub idle_delay: Duration,
    pub periodic_interval: Duration,
    pub lease_ttl: Duration,
    /// Change-feed entries requested per pull
    pub pull_page_size: usize,
}

impl ClientConfig {
    /// Configuration with defaults for the given terminal.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            database_url: "sqlite://tillsync.db".to_string(),
            server_url: None,
            api_key: None,
            sync_enabled: true,
            batch_size: 200,
            max_attempts: 8,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(30),
            idle_delay: Duration::from_secs(10),
            periodic_interval: Duration::from_secs(5 * 60),
            lease_ttl: Duration::from_secs(2 * 60),
            pull_page_size: 500,
        }
    }

    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let device_id = env::var("TILLSYNC_DEVICE_ID").map_err(|_| ConfigError::MissingDeviceId)?;
        let mut config = Self::new(device_id);

        if let Ok(url) = env::var("TILLSYNC_DATABASE_URL") {
            config.database_url = url;
        }
        config.server_url = env::var("TILLSYNC_SERVER_URL").ok();
        config.api_key = env::var("TILLSYNC_API_KEY").ok();

        if let Ok(value) = env::var("TILLSYNC_SYNC_ENABLED") {
            config.sync_enabled = parse_bool(&value)
                .ok_or_else(|| ConfigError::Invalid("TILLSYNC_SYNC_ENABLED", value.clone()))?;
        }
        if let Ok(value) = env::var("TILLSYNC_BATCH_SIZE") {
            let size: usize = value
                .parse()
                .map_err(|_| ConfigError::Invalid("TILLSYNC_BATCH_SIZE", value.clone()))?;
            config = config.with_batch_size(size);
        }
        if let Ok(value) = env::var("TILLSYNC_MAX_ATTEMPTS") {
            config.max_attempts = value
                .parse()
                .map_err(|_| ConfigError::Invalid("TILLSYNC_MAX_ATTEMPTS", value.clone()))?;
        }
        if let Some(timeout) = seconds("TILLSYNC_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = timeout;
        }
        if let Some(delay) = seconds("TILLSYNC_IDLE_SECS")? {
            config.idle_delay = delay;
        }
        if let Some(interval) = seconds("TILLSYNC_PERIODIC_SECS")? {
            config.periodic_interval = interval;
        }

        Ok(config)
    }

    /// Builder-style batch size, clamped to `1..=500`.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_server(mut self, url: impl Into<String>, api_key: Option<String>) -> Self {
        self.server_url = Some(url.into());
        self.api_key = api_key;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: self.backoff_base,
            cap: self.backoff_cap,
            max_attempts: self.max_attempts,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn seconds(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::Invalid(key, value)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TILLSYNC_DEVICE_ID environment variable is required")]
    MissingDeviceId,

    #[error("Invalid {0} value: {1}")]
    Invalid(&'static str, String),
}

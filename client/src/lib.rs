//! # Tillsync Client
//!
//! The device side of tillsync: an embedded SQLite store, the outbox, and the
//! sync worker that reconciles one point-of-sale terminal with the cloud.
//!
//! Record producers only talk to [`SyncService`]:
//!
//! - [`SyncService::submit_change`] is the single gateway for syncable writes.
//!   The row and its outbox entry commit in one transaction.
//! - [`SyncService::sync_state`], [`SyncService::list_conflicts`] and
//!   [`SyncService::resolve_conflict`] feed status displays.
//! - [`SyncService::start_scheduler`] runs cycles in the background; a
//!   [`SchedulerHandle`] sends triggers and streams [`SyncEvent`]s.
//!
//! ```no_run
//! use serde_json::json;
//! use tillsync_client::{OpType, SyncService};
//!
//! # async fn run() -> tillsync_client::Result<()> {
//! let service = SyncService::from_env().await?;
//! service.set_session_user(Some("cashier-7".into()));
//!
//! let version = service
//!     .submit_change("ingredients", "flour", OpType::Insert, Some(json!({"name": "Flour"})))
//!     .await?;
//! assert_eq!(version, 1);
//!
//! let scheduler = service.start_scheduler();
//! let state = service.sync_state().await?;
//! println!("{} pending, status {}", state.pending_count, state.color);
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod conflict_log;
pub mod db;
pub mod error;
pub mod lease;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod tracker;
pub mod transport;

pub use client::{CycleReport, SyncClient};
pub use config::{ClientConfig, ConfigError};
pub use conflict_log::ConflictLog;
pub use error::{ClientError, Result};
pub use lease::LeaseLock;
pub use queue::SyncQueue;
pub use scheduler::{SchedulerHandle, SyncEvent, Trigger};
pub use service::SyncService;
pub use state::DeviceStateStore;
pub use tracker::{ChangeTracker, RemoteApply};
pub use transport::{HttpTransport, MemoryTransport, Transport};

pub use tillsync_engine::{
    ConflictQuery, OpType, Resolution, Schema, Side, SyncColor, SyncStateView,
};

//! # Tillsync Engine
//!
//! The synchronization and conflict-resolution core of a local-first
//! point-of-sale suite.
//!
//! Terminals keep working offline against their own embedded store and later
//! reconcile with one authoritative cloud store. This crate holds the logic
//! both sides share: the data model, schema validation, the conflict
//! resolver, the outbound queue state machine, and the wire protocol.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or databases
//! - **Deterministic**: The same change against the same state always resolves the same way
//! - **Auditable**: Every non-trivial merge produces a [`ConflictLogEntry`]
//!
//! ## Core Concepts
//!
//! ### Change records
//!
//! Every syncable mutation is a [`ChangeRecord`] carrying a monotonic
//! version, the `base_version` the device last observed from the cloud, a
//! UTC timestamp, the originating device and user, and a table-tagged
//! [`TablePayload`] snapshot.
//!
//! ### Resolution
//!
//! The [`Resolver`] compares an uploaded change with the stored
//! [`StoredRecord`] and applies the table's [`ConflictPolicy`]:
//! - [`ConflictPolicy::LastWriteWins`] - later [`WriteStamp`] wins, device id breaks ties
//! - [`ConflictPolicy::ManualReview`] - held until an operator resolves it
//!
//! ### Queue
//!
//! [`SyncQueueEntry`] and [`QueueStatus`] encode the outbox state machine;
//! [`RetryPolicy`] computes capped exponential backoff.
//!
//! ## Quick Start
//!
//! ```rust
//! use tillsync_engine::{
//!     BatchRequest, ChangeRecord, MemoryCloud, OpType, RecordKey, Schema, TablePayload,
//! };
//! use chrono::Utc;
//! use serde_json::json;
//!
//! // 1. The cloud accepts the built-in retail schema
//! let schema = Schema::retail();
//! let mut cloud = MemoryCloud::new(schema.clone());
//!
//! // 2. A terminal creates an ingredient offline
//! let payload = schema
//!     .decode_payload("ingredients", json!({"name": "Flour", "unit": "kg"}))
//!     .unwrap();
//! let change = ChangeRecord::new(
//!     OpType::Insert,
//!     RecordKey::new("ingredients", "flour"),
//!     "till-1",
//!     1,
//!     Utc::now(),
//! )
//! .with_payload(payload);
//!
//! // 3. Later it uploads the change
//! let request = BatchRequest {
//!     device_id: "till-1".to_string(),
//!     schema_version: schema.version,
//!     changes: vec![change],
//! };
//! let response = cloud.apply_batch(&request, Utc::now()).unwrap();
//! assert!(response.results[0].is_applied());
//! assert_eq!(response.results[0].version, 1);
//! ```

pub mod change;
pub mod cloud;
pub mod conflict;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod resolver;
pub mod schema;
pub mod stamp;
pub mod state;

// Re-export main types at crate root
pub use change::{ChangeRecord, OpType, RecordKey};
pub use cloud::MemoryCloud;
pub use conflict::{
    ConflictLogEntry, ConflictQuery, ConflictType, Resolution, Side, LWW_RESOLVER,
    RETRY_RESOLVER, ROLLBACK_RESOLVER,
};
pub use error::Error;
pub use payload::TablePayload;
pub use protocol::{
    BatchRequest, BatchResponse, ChangeResult, FeedEntry, FeedReason, PullQuery, PullResponse,
    RemoteChange, ResolveRequest, ResolveResponse, ResultStatus, SchemaInfo, DEFAULT_PULL_LIMIT,
    MAX_PULL_LIMIT,
};
pub use queue::{select_batch, QueueStatus, RetryDecision, RetryPolicy, SyncQueueEntry};
pub use record::StoredRecord;
pub use resolver::{Outcome, Resolver, CLOUD_DEVICE};
pub use schema::{ConflictPolicy, FieldDef, FieldType, Schema, TableSchema};
pub use stamp::WriteStamp;
pub use state::{DeviceStatus, DeviceSyncState, SyncColor, SyncSignals, SyncStateView};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type DeviceId = String;
pub type UserId = String;
pub type Version = u64;
pub type SchemaVersion = u32;
pub type Sequence = u64;
pub type QueueId = i64;
pub type ChangeId = uuid::Uuid;
pub type ConflictId = uuid::Uuid;
pub type Timestamp = chrono::DateTime<chrono::Utc>;

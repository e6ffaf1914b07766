//! Device-to-cloud transport.
//!
//! [`HttpTransport`] talks to the cloud service; [`MemoryTransport`] wraps the
//! engine's reference store in-process, with fault injection for tests.

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::MemoryTransport;

use crate::error::Result;
use std::future::Future;
use tillsync_engine::{
    BatchRequest, BatchResponse, ConflictId, ConflictLogEntry, ConflictQuery, PullQuery,
    PullResponse, ResolveRequest, ResolveResponse, SchemaVersion,
};

/// Calls the sync client makes against the cloud.
///
/// Every call is bounded by a timeout; a timeout surfaces as a retryable
/// network error.
pub trait Transport: Send + Sync {
    /// Schema version the cloud currently accepts.
    fn schema_version(&self) -> impl Future<Output = Result<SchemaVersion>> + Send;

    fn upload(&self, request: &BatchRequest) -> impl Future<Output = Result<BatchResponse>> + Send;

    fn pull(&self, query: PullQuery) -> impl Future<Output = Result<PullResponse>> + Send;

    fn list_conflicts(
        &self,
        query: &ConflictQuery,
    ) -> impl Future<Output = Result<Vec<ConflictLogEntry>>> + Send;

    fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        request: &ResolveRequest,
    ) -> impl Future<Output = Result<ResolveResponse>> + Send;
}

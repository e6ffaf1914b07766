use super::Transport;
use crate::error::{ClientError, Result};
use chrono::Utc;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::time::Duration;
use tillsync_engine::{
    BatchRequest, BatchResponse, ConflictId, ConflictLogEntry, ConflictQuery, MemoryCloud,
    PullQuery, PullResponse, ResolveRequest, ResolveResponse, SchemaVersion,
};

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    /// Apply the next upload, then lose the response
    drop_next_response: bool,
    /// Apply only this many changes of the next upload, then fail
    fail_next_upload_after: Option<usize>,
    /// Stall the next upload before the cloud sees it
    delay_next_upload: Option<Duration>,
}

/// In-process transport over a shared [`MemoryCloud`].
///
/// Transports created with [`attach`](Self::attach) share one cloud but keep
/// their own faults and counters, so each simulated terminal gets its own link.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    cloud: Arc<Mutex<MemoryCloud>>,
    faults: Arc<Mutex<Faults>>,
    uploads: Arc<AtomicUsize>,
    changes_sent: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new(cloud: MemoryCloud) -> Self {
        Self::shared(Arc::new(Mutex::new(cloud)))
    }

    fn shared(cloud: Arc<Mutex<MemoryCloud>>) -> Self {
        Self {
            cloud,
            faults: Arc::default(),
            uploads: Arc::default(),
            changes_sent: Arc::default(),
        }
    }

    /// A new link to the same cloud.
    pub fn attach(&self) -> Self {
        Self::shared(Arc::clone(&self.cloud))
    }

    /// Run `f` against the cloud state.
    pub fn with_cloud<R>(&self, f: impl FnOnce(&mut MemoryCloud) -> R) -> Result<R> {
        Ok(f(&mut *self.lock_cloud()?))
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.offline = offline;
        }
    }

    /// The next upload is applied by the cloud but its response never arrives.
    pub fn drop_next_response(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.drop_next_response = true;
        }
    }

    /// The connection drops after the cloud applied `applied` changes of the
    /// next upload.
    pub fn fail_next_upload_after(&self, applied: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_next_upload_after = Some(applied);
        }
    }

    /// The next upload waits `delay` before reaching the cloud.
    pub fn delay_next_upload(&self, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.delay_next_upload = Some(delay);
        }
    }

    /// Upload requests received, including failed ones.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Changes that left the device across all uploads.
    pub fn changes_sent(&self) -> usize {
        self.changes_sent.load(Ordering::SeqCst)
    }

    fn lock_cloud(&self) -> Result<MutexGuard<'_, MemoryCloud>> {
        self.cloud
            .lock()
            .map_err(|_| ClientError::network("cloud state poisoned"))
    }

    fn check_online(&self) -> Result<()> {
        match self.faults.lock() {
            Ok(faults) if !faults.offline => Ok(()),
            _ => Err(ClientError::network("connection refused")),
        }
    }

    fn take_delay(&self) -> Option<Duration> {
        self.faults
            .lock()
            .ok()
            .and_then(|mut faults| faults.delay_next_upload.take())
    }

    fn take_upload_faults(&self) -> (bool, Option<usize>) {
        match self.faults.lock() {
            Ok(mut faults) => (
                std::mem::take(&mut faults.drop_next_response),
                faults.fail_next_upload_after.take(),
            ),
            Err(_) => (false, None),
        }
    }
}

impl Transport for MemoryTransport {
    async fn schema_version(&self) -> Result<SchemaVersion> {
        self.check_online()?;
        Ok(self.lock_cloud()?.schema_version())
    }

    async fn upload(&self, request: &BatchRequest) -> Result<BatchResponse> {
        self.check_online()?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.changes_sent
            .fetch_add(request.changes.len(), Ordering::SeqCst);
        if let Some(delay) = self.take_delay() {
            tokio::time::sleep(delay).await;
        }

        let (drop_response, fail_after) = self.take_upload_faults();
        let now = Utc::now();
        let mut cloud = self.lock_cloud()?;

        if let Some(applied) = fail_after {
            let partial = BatchRequest {
                changes: request.changes.iter().take(applied).cloned().collect(),
                ..request.clone()
            };
            cloud.apply_batch(&partial, now)?;
            return Err(ClientError::network(format!(
                "connection reset after {applied} changes"
            )));
        }

        let response = cloud.apply_batch(request, now)?;
        if drop_response {
            return Err(ClientError::network("response lost"));
        }
        Ok(response)
    }

    async fn pull(&self, query: PullQuery) -> Result<PullResponse> {
        self.check_online()?;
        Ok(self.lock_cloud()?.pull(&query))
    }

    async fn list_conflicts(&self, query: &ConflictQuery) -> Result<Vec<ConflictLogEntry>> {
        self.check_online()?;
        Ok(self.lock_cloud()?.conflicts(query))
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        request: &ResolveRequest,
    ) -> Result<ResolveResponse> {
        self.check_online()?;
        Ok(self.lock_cloud()?.resolve_conflict(
            conflict_id,
            request.side,
            &request.resolver,
            Utc::now(),
        )?)
    }
}

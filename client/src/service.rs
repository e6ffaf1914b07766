//! The device-facing API: ingestion for record producers and status for
//! displays.

use crate::client::{CycleReport, SyncClient};
use crate::config::ClientConfig;
use crate::conflict_log::ConflictLog;
use crate::db::{self, Pool};
use crate::error::{ClientError, Result};
use crate::queue::SyncQueue;
use crate::scheduler::{self, SchedulerHandle};
use crate::tracker::ChangeTracker;
use crate::transport::{HttpTransport, Transport};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tillsync_engine::{
    ConflictId, ConflictLogEntry, ConflictQuery, DeviceStatus, OpType, ResolveRequest,
    ResolveResponse, Schema, Side, SyncSignals, SyncStateView, UserId, Version,
};

/// One device's sync engine.
#[derive(Debug)]
pub struct SyncService<T = HttpTransport> {
    config: Arc<ClientConfig>,
    pool: Pool,
    tracker: ChangeTracker,
    log: ConflictLog,
    client: Arc<SyncClient<T>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl SyncService<HttpTransport> {
    /// Open the device store named by the environment, with the built-in
    /// retail schema and the HTTP transport.
    pub async fn from_env() -> Result<Self> {
        let config = ClientConfig::from_env()?;
        let pool = db::create_pool(&config.database_url).await?;
        let transport = HttpTransport::from_config(&config)?;
        Self::open(config, Schema::retail(), pool, transport).await
    }
}

impl<T: Transport + 'static> SyncService<T> {
    /// Migrate the store and wire the components together.
    pub async fn open(
        config: ClientConfig,
        schema: Schema,
        pool: Pool,
        transport: T,
    ) -> Result<Self> {
        db::run_migrations(&pool).await?;
        let config = Arc::new(config);

        let tracker = ChangeTracker::new(pool.clone(), Arc::new(schema), config.device_id.clone());
        let client = Arc::new(SyncClient::new(
            Arc::clone(&config),
            pool.clone(),
            tracker.clone(),
            transport,
        ));

        // a process that died mid-cycle left the indicator on syncing
        let state = client.state().load().await?;
        if state.status == DeviceStatus::Syncing {
            client
                .state()
                .set_status(
                    DeviceStatus::Offline,
                    state.last_error.as_deref(),
                    state.schema_blocked,
                )
                .await?;
        }

        tracing::info!(
            device_id = %config.device_id,
            schema_version = tracker.schema().version,
            enabled = config.sync_enabled,
            "sync service opened"
        );

        Ok(Self {
            log: ConflictLog::new(pool.clone()),
            config,
            pool,
            tracker,
            client,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The change tracker, for producers that write inside their own
    /// transaction.
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn client(&self) -> &SyncClient<T> {
        &self.client
    }

    pub fn set_session_user(&self, user: Option<UserId>) {
        self.tracker.set_session_user(user);
    }

    /// Record a local mutation. Returns the record's new version.
    pub async fn submit_change(
        &self,
        table: &str,
        record_id: &str,
        op: OpType,
        payload: Option<Value>,
    ) -> Result<Version> {
        let version = self
            .tracker
            .submit_change(table, record_id, op, payload)
            .await?;
        if let Some(scheduler) = self.scheduler_handle() {
            scheduler.notify_write();
        }
        Ok(version)
    }

    /// Conflicts known to this device, including while offline.
    pub async fn list_conflicts(&self, query: &ConflictQuery) -> Result<Vec<ConflictLogEntry>> {
        self.log.list(query).await
    }

    /// The cloud's authoritative conflict log.
    pub async fn list_remote_conflicts(
        &self,
        query: &ConflictQuery,
    ) -> Result<Vec<ConflictLogEntry>> {
        self.client.transport().list_conflicts(query).await
    }

    /// Settle a held conflict in the cloud and apply the outcome locally.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        side: Side,
        resolver: &str,
    ) -> Result<ResolveResponse> {
        let request = ResolveRequest {
            side,
            resolver: resolver.to_string(),
        };
        let response = self
            .client
            .transport()
            .resolve_conflict(conflict_id, &request)
            .await?;

        let now = db::now();
        let mut tx = self.pool.begin().await?;
        db::upsert_record(&mut tx, &response.record).await?;
        let released = SyncQueue::release_in(&mut tx, conflict_id, now).await?;
        ConflictLog::append_in(&mut tx, &response.conflict).await?;
        tx.commit().await?;

        tracing::info!(
            %conflict_id,
            side = %side,
            resolver,
            version = response.record.version,
            released,
            "conflict resolved"
        );
        Ok(response)
    }

    /// Snapshot for a status display.
    pub async fn sync_state(&self) -> Result<SyncStateView> {
        let state = self.client.state().load().await?;
        let mut signals = SyncSignals::from_state(&state);
        signals.pending_count = self.client.queue().pending_count().await?;
        signals.abandoned_count = self.client.queue().abandoned_count().await?;
        signals.open_conflicts = self.log.open_count().await?;

        Ok(SyncStateView {
            device_id: state.device_id,
            color: signals.color(),
            status: state.status,
            enabled: self.config.sync_enabled,
            server_url: self.config.server_url.clone(),
            pending_count: signals.pending_count,
            open_conflicts: signals.open_conflicts,
            abandoned_count: signals.abandoned_count,
            last_sync_at: state.last_successful_sync_at,
            last_acked_sequence: state.last_acked_sequence,
            last_error: state.last_error,
        })
    }

    /// Sync until the outbox is drained or a cycle stops making progress.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        if !self.config.sync_enabled {
            return Err(ClientError::Disabled);
        }
        self.client.drain().await
    }

    /// Start the background worker, or return the running one.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        let mut slot = match self.scheduler.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.get_or_insert_with(|| {
            scheduler::spawn(Arc::clone(&self.client), Arc::clone(&self.config))
        })
        .clone()
    }

    /// Stop the background worker, if running.
    pub async fn shutdown(&self) {
        let handle = match self.scheduler.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    fn scheduler_handle(&self) -> Option<SchedulerHandle> {
        self.scheduler.lock().ok().and_then(|slot| slot.clone())
    }
}

//! The sync cycle.
//!
//! One cycle, run under the device's sync lease:
//!
//! 1. Reset entries a previous cycle left in flight
//! 2. Compare schema versions; a mismatch ends the cycle before any upload
//! 3. Upload one batch and settle every entry from its per-change result
//! 4. Pull the change feed after the stored cursor, all pages
//! 5. Apply the pulled changes and advance the cursor in one transaction
//!
//! No network call is made while a local transaction is open.

use crate::config::ClientConfig;
use crate::conflict_log::ConflictLog;
use crate::db::{self, Pool};
use crate::error::Result;
use crate::lease::LeaseLock;
use crate::queue::SyncQueue;
use crate::state::DeviceStateStore;
use crate::tracker::{ChangeTracker, RemoteApply};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tillsync_engine::{
    BatchRequest, BatchResponse, DeviceStatus, Error, PullQuery, RemoteChange, Resolution,
    RetryDecision, Sequence, SyncQueueEntry, TableName, Timestamp,
};

/// Cycles run by one drain before giving up on an ever-refilling queue.
const MAX_DRAIN_CYCLES: usize = 64;

/// What one sync cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Changes sent in the batch
    pub uploaded: usize,
    pub applied: usize,
    pub auto_resolved: usize,
    /// Held for manual review
    pub held: usize,
    pub abandoned: usize,
    /// Failed and scheduled for retry
    pub failed: usize,
    pub pulled: usize,
    /// Pulled changes not applied locally
    pub skipped: usize,
    /// Uploaded changes per table
    pub per_table: BTreeMap<TableName, usize>,
    /// Feed cursor after the cycle
    pub next_seq: Sequence,
}

impl CycleReport {
    pub fn made_progress(&self) -> bool {
        self.uploaded > 0 || self.pulled > 0
    }

    /// Fold a later cycle into this report.
    pub fn merge(&mut self, other: CycleReport) {
        self.uploaded += other.uploaded;
        self.applied += other.applied;
        self.auto_resolved += other.auto_resolved;
        self.held += other.held;
        self.abandoned += other.abandoned;
        self.failed += other.failed;
        self.pulled += other.pulled;
        self.skipped += other.skipped;
        for (table, count) in other.per_table {
            *self.per_table.entry(table).or_default() += count;
        }
        self.next_seq = self.next_seq.max(other.next_seq);
    }
}

/// Drives sync cycles for one device.
#[derive(Debug)]
pub struct SyncClient<T> {
    config: Arc<ClientConfig>,
    pool: Pool,
    transport: T,
    tracker: ChangeTracker,
    queue: SyncQueue,
    state: DeviceStateStore,
    lease: LeaseLock,
}

impl<T: Transport> SyncClient<T> {
    pub fn new(
        config: Arc<ClientConfig>,
        pool: Pool,
        tracker: ChangeTracker,
        transport: T,
    ) -> Self {
        let queue = SyncQueue::new(pool.clone(), config.retry_policy());
        let state = DeviceStateStore::new(pool.clone(), config.device_id.clone());
        let holder = format!("{}:{}", config.device_id, uuid::Uuid::new_v4().simple());
        let lease = LeaseLock::new(pool.clone(), holder, config.lease_ttl);

        Self {
            config,
            pool,
            transport,
            tracker,
            queue,
            state,
            lease,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn state(&self) -> &DeviceStateStore {
        &self.state
    }

    /// Run one cycle under the sync lease.
    ///
    /// Fails with `SyncLockHeld` when another process holds the lease; the
    /// caller should skip rather than retry immediately.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.lease.acquire(db::now()).await?;
        let result = self.cycle().await;

        if let Err(e) = &result {
            let status = if e.is_retryable() {
                DeviceStatus::Offline
            } else {
                DeviceStatus::Online
            };
            let error = e.to_string();
            if let Err(status_err) = self
                .state
                .set_status(status, Some(&error), e.is_schema_mismatch())
                .await
            {
                tracing::warn!(error = %status_err, "failed to record sync status");
            }
        }
        if let Err(e) = self.lease.release().await {
            tracing::warn!(error = %e, "failed to release sync lease");
        }

        match &result {
            Ok(report) => tracing::info!(
                device_id = %self.config.device_id,
                uploaded = report.uploaded,
                applied = report.applied,
                auto_resolved = report.auto_resolved,
                held = report.held,
                abandoned = report.abandoned,
                failed = report.failed,
                pulled = report.pulled,
                skipped = report.skipped,
                sequence = report.next_seq,
                "sync cycle complete"
            ),
            Err(e) if e.is_schema_mismatch() => tracing::warn!(
                device_id = %self.config.device_id,
                error = %e,
                "sync cycle aborted: schema mismatch"
            ),
            Err(e) => tracing::warn!(
                device_id = %self.config.device_id,
                error = %e,
                retryable = e.is_retryable(),
                "sync cycle failed"
            ),
        }
        result
    }

    /// Repair the store after a cycle was dropped before it finished.
    ///
    /// Entries the cycle left `sent` go back to the queue and the syncing
    /// indicator is cleared. The cursor only moves when a cycle commits its
    /// pull, so it needs no repair.
    pub async fn abort_cycle(&self) -> Result<()> {
        let recovered = self.queue.recover_in_flight(db::now()).await?;
        let state = self.state.load().await?;
        if state.status == DeviceStatus::Syncing {
            self.state
                .set_status(DeviceStatus::Offline, Some("sync cancelled"), state.schema_blocked)
                .await?;
        }
        self.lease.release().await?;

        tracing::info!(
            device_id = %self.config.device_id,
            recovered,
            "cancelled sync cycle cleaned up"
        );
        Ok(())
    }

    /// Run cycles while they make progress and uploadable entries remain.
    pub async fn drain(&self) -> Result<CycleReport> {
        let mut total = self.run_cycle().await?;
        let mut last_uploaded = total.uploaded;

        for _ in 1..MAX_DRAIN_CYCLES {
            if last_uploaded == 0 || !self.queue.has_eligible(db::now()).await? {
                break;
            }
            let report = self.run_cycle().await?;
            last_uploaded = report.uploaded;
            total.merge(report);
        }
        Ok(total)
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let previous = self.state.load().await?;
        self.state
            .set_status(DeviceStatus::Syncing, None, previous.schema_blocked)
            .await?;

        let recovered = self.queue.recover_in_flight(db::now()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "re-queued entries left in flight");
        }

        let remote = self.transport.schema_version().await?;
        self.tracker.schema().check_compatible(remote)?;

        let batch = self
            .queue
            .dequeue_batch(self.config.batch_size, db::now())
            .await?;
        if !batch.is_empty() {
            self.upload(&batch, &mut report).await?;
        }

        let changes = self.pull_all(previous.last_acked_sequence).await?;
        self.apply_pulled(changes, previous.last_acked_sequence, &mut report)
            .await?;

        Ok(report)
    }

    async fn upload(&self, batch: &[SyncQueueEntry], report: &mut CycleReport) -> Result<()> {
        report.uploaded = batch.len();
        for entry in batch {
            *report
                .per_table
                .entry(entry.change.table_name.clone())
                .or_default() += 1;
        }

        let request = BatchRequest {
            device_id: self.config.device_id.clone(),
            schema_version: self.tracker.schema().version,
            changes: batch.iter().map(|e| e.change.clone()).collect(),
        };

        match self.transport.upload(&request).await {
            Ok(response) => self.settle(batch, &response, report).await,
            Err(e) if e.is_schema_mismatch() => {
                // refused before any record was touched
                self.queue.recover_in_flight(db::now()).await?;
                Err(e)
            }
            Err(e) => {
                let reason = e.to_string();
                let now = db::now();
                let mut tx = self.pool.begin().await?;
                for entry in batch {
                    let decision = SyncQueue::fail_in(
                        &mut tx,
                        self.queue.policy(),
                        entry.queue_id,
                        &reason,
                        now,
                    )
                    .await?;
                    count_failure(decision, report);
                }
                tx.commit().await?;
                Err(e)
            }
        }
    }

    /// Apply per-change results to the outbox and the conflict mirror.
    async fn settle(
        &self,
        batch: &[SyncQueueEntry],
        response: &BatchResponse,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now = db::now();
        let mut tx = self.pool.begin().await?;

        for entry in batch {
            let Some(result) = response.result_for(entry.change.change_id) else {
                let decision = SyncQueue::fail_in(
                    &mut tx,
                    self.queue.policy(),
                    entry.queue_id,
                    "no result returned for change",
                    now,
                )
                .await?;
                count_failure(decision, report);
                continue;
            };

            if result.is_applied() {
                SyncQueue::ack_in(&mut tx, entry.queue_id, now).await?;
                db::set_synced_version(&mut tx, &entry.key(), result.version).await?;
                report.applied += 1;
                continue;
            }

            if let Some(conflict) = &result.conflict {
                ConflictLog::append_in(&mut tx, conflict).await?;
            }
            match (result.resolution, result.conflict_id) {
                (Some(Resolution::AutoResolved), _) => {
                    SyncQueue::ack_in(&mut tx, entry.queue_id, now).await?;
                    report.auto_resolved += 1;
                }
                (Some(Resolution::ManualReview), Some(conflict_id)) => {
                    SyncQueue::hold_in(&mut tx, entry.queue_id, conflict_id, now).await?;
                    report.held += 1;
                    tracing::warn!(
                        queue_id = entry.queue_id,
                        key = %entry.key(),
                        %conflict_id,
                        "change held for manual review"
                    );
                }
                (Some(Resolution::RolledBack), conflict_id) => {
                    let corruption = Error::CorruptionDetected {
                        table: entry.change.table_name.clone(),
                        record_id: entry.change.record_id.clone(),
                        detail: format!(
                            "cloud rejected version {} over base {}",
                            entry.change.version, entry.change.base_version
                        ),
                    };
                    SyncQueue::abandon_in(&mut tx, entry.queue_id, &corruption.to_string(), now)
                        .await?;
                    // later edits are based on what the cloud actually holds
                    db::set_synced_version(&mut tx, &entry.key(), result.version).await?;
                    report.abandoned += 1;
                    tracing::error!(
                        queue_id = entry.queue_id,
                        key = %entry.key(),
                        conflict_id = ?conflict_id,
                        error = %corruption,
                        "change rolled back by cloud, record abandoned"
                    );
                }
                _ => {
                    let decision = SyncQueue::fail_in(
                        &mut tx,
                        self.queue.policy(),
                        entry.queue_id,
                        "conflict result without resolution",
                        now,
                    )
                    .await?;
                    count_failure(decision, report);
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pull_all(&self, since: Sequence) -> Result<Vec<RemoteChange>> {
        let mut cursor = since;
        let mut changes = Vec::new();
        loop {
            let page = self
                .transport
                .pull(PullQuery::new(cursor, self.config.pull_page_size))
                .await?;
            let empty = page.changes.is_empty();
            cursor = cursor.max(page.next_seq);
            changes.extend(page.changes);
            if !page.has_more || empty {
                break;
            }
        }
        Ok(changes)
    }

    async fn apply_pulled(
        &self,
        changes: Vec<RemoteChange>,
        since: Sequence,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now: Timestamp = db::now();
        let mut tx = self.pool.begin().await?;

        let mut cursor = since;
        for remote in &changes {
            match ChangeTracker::apply_remote_in(&mut tx, remote, now).await? {
                RemoteApply::Applied => report.pulled += 1,
                RemoteApply::Skipped => report.skipped += 1,
            }
            cursor = cursor.max(remote.sequence);
        }

        let mut state = DeviceStateStore::load_in(&mut tx, &self.config.device_id).await?;
        state.commit_cycle(cursor, now);
        DeviceStateStore::commit_in(&mut tx, &state).await?;
        tx.commit().await?;

        report.next_seq = cursor;
        Ok(())
    }
}

fn count_failure(decision: RetryDecision, report: &mut CycleReport) {
    match decision {
        RetryDecision::Retry { .. } => report.failed += 1,
        RetryDecision::Abandon => report.abandoned += 1,
    }
}

//! Outbound queue entries, their state machine, and retry backoff.
//!
//! ```text
//! pending -> sent -> acked (terminal)
//!                 -> conflict (held) -> acked after manual resolve
//!                 -> failed -> sent (after backoff, repeatable)
//!                           -> abandoned (terminal)
//! ```
//!
//! Entries are persisted by the device store; this module only decides which
//! moves are legal and when a failed entry becomes eligible again.

use crate::{
    error::Result, ChangeRecord, ConflictId, Error, QueueId, RecordKey, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Sent,
    Acked,
    Conflict,
    Failed,
    Abandoned,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Acked => "acked",
            QueueStatus::Conflict => "conflict",
            QueueStatus::Failed => "failed",
            QueueStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(QueueStatus::Pending),
            "sent" => Some(QueueStatus::Sent),
            "acked" => Some(QueueStatus::Acked),
            "conflict" => Some(QueueStatus::Conflict),
            "failed" => Some(QueueStatus::Failed),
            "abandoned" => Some(QueueStatus::Abandoned),
            _ => None,
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Acked | QueueStatus::Abandoned)
    }

    /// The entry still has to reach the cloud.
    pub fn is_unsettled(&self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Sent | QueueStatus::Failed
        )
    }

    /// Waiting in the outbox: a newer change for the same record may replace
    /// it, unless an earlier attempt already reached the wire.
    pub fn is_supersedable(&self) -> bool {
        matches!(self, QueueStatus::Pending)
    }

    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Abandoned)
                | (Sent, Acked)
                | (Sent, Conflict)
                | (Sent, Failed)
                | (Sent, Abandoned)
                // recovery after a crashed or cancelled cycle
                | (Sent, Pending)
                | (Failed, Sent)
                | (Failed, Pending)
                | (Failed, Abandoned)
                | (Conflict, Acked)
        )
    }

    /// Check a transition against the state machine.
    pub fn transition(&self, next: QueueStatus) -> Result<QueueStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry and backoff settings for failed uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15 * 60),
            max_attempts: 8,
        }
    }
}

/// What to do with an entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `next_retry_at` has passed
    Retry { next_retry_at: Timestamp },
    /// Give up: the entry goes to `abandoned`
    Abandon,
}

impl RetryPolicy {
    /// `base * 2^attempts`, capped.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Decide the fate of an entry that has now failed `attempts` times.
    pub fn decide(&self, attempts: u32, now: Timestamp) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::Abandon;
        }
        let delay = chrono::Duration::from_std(self.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs() as i64));
        RetryDecision::Retry {
            next_retry_at: now + delay,
        }
    }
}

/// One outbound change descriptor in a device's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub queue_id: QueueId,
    pub change: ChangeRecord,
    pub status: QueueStatus,
    pub attempt_count: u32,
    pub next_retry_at: Option<Timestamp>,
    /// Set while the entry is held for manual review
    pub conflict_id: Option<ConflictId>,
    pub last_error: Option<String>,
    /// Left the device at least once; the cloud may already have applied it
    #[serde(default)]
    pub transmitted: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SyncQueueEntry {
    pub fn new(queue_id: QueueId, change: ChangeRecord, now: Timestamp) -> Self {
        Self {
            queue_id,
            change,
            status: QueueStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            conflict_id: None,
            last_error: None,
            transmitted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> RecordKey {
        self.change.key()
    }

    /// Whether a batch taken at `now` may include this entry.
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Failed => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    fn move_to(&mut self, next: QueueStatus, now: Timestamp) -> Result<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_sent(&mut self, now: Timestamp) -> Result<()> {
        self.move_to(QueueStatus::Sent, now)?;
        self.transmitted = true;
        Ok(())
    }

    pub fn ack(&mut self, now: Timestamp) -> Result<()> {
        self.move_to(QueueStatus::Acked, now)
    }

    pub fn hold(&mut self, conflict_id: ConflictId, now: Timestamp) -> Result<()> {
        self.move_to(QueueStatus::Conflict, now)?;
        self.conflict_id = Some(conflict_id);
        Ok(())
    }

    pub fn abandon(&mut self, reason: impl Into<String>, now: Timestamp) -> Result<()> {
        self.move_to(QueueStatus::Abandoned, now)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Record a failed attempt and apply the retry policy.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: Timestamp,
    ) -> Result<RetryDecision> {
        self.status.transition(QueueStatus::Failed)?;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.into());
        let decision = policy.decide(self.attempt_count, now);
        match decision {
            RetryDecision::Retry { next_retry_at } => {
                self.status = QueueStatus::Failed;
                self.next_retry_at = Some(next_retry_at);
            }
            RetryDecision::Abandon => {
                self.status = QueueStatus::Abandoned;
                self.next_retry_at = None;
            }
        }
        self.updated_at = now;
        Ok(decision)
    }

    /// Replace the queued change with a newer one for the same record.
    ///
    /// Returns `false` (and leaves the entry alone) once the entry has been
    /// transmitted or settled, or when it already holds a newer version. A
    /// transmitted change may have been applied with only the response lost,
    /// so the newer change has to follow it as its own entry.
    pub fn supersede(&mut self, newer: &ChangeRecord, now: Timestamp) -> bool {
        if self.transmitted
            || !self.status.is_supersedable()
            || self.change.key() != newer.key()
            || newer.version <= self.change.version
        {
            return false;
        }
        self.change = self.change.supersede_with(newer);
        self.updated_at = now;
        true
    }
}

/// Select a batch from entries in queue order without reordering any key.
///
/// Once a key's earliest remaining entry is ineligible, later entries for
/// that key are skipped too.
pub fn select_batch<'a, I>(entries: I, max: usize, now: Timestamp) -> Vec<&'a SyncQueueEntry>
where
    I: IntoIterator<Item = &'a SyncQueueEntry>,
{
    let mut blocked = std::collections::HashSet::new();
    let mut batch = Vec::new();
    for entry in entries {
        if batch.len() >= max {
            break;
        }
        if entry.status.is_terminal() {
            continue;
        }
        let key = entry.key();
        if blocked.contains(&key) {
            continue;
        }
        if entry.is_eligible(now) {
            batch.push(entry);
        }
        // one entry per key per batch keeps per-record order intact
        blocked.insert(key);
    }
    batch
}

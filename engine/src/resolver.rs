//! Conflict resolution for uploaded changes.
//!
//! This is the core of the cloud's write path. Given an uploaded change and
//! the currently stored record, the resolver decides what the authoritative
//! state becomes, which conflict log entry (if any) records the decision, and
//! which change-feed entry lets devices converge.
//!
//! # Rules
//!
//! With `base` the version the device observed and `remote` the stored
//! version (0 when the record does not exist yet):
//!
//! 1. A redelivered change equal to the stored state is applied as a no-op
//! 2. `version <= base` can never be produced by a device: rolled back
//! 3. `base == remote`: sequential write, accepted
//! 4. `base < remote`: concurrent edit, settled by the table's policy
//!    - [`ConflictPolicy::LastWriteWins`]: later [`WriteStamp`](crate::WriteStamp)
//!      wins, stored as `max(local, remote) + 1`, logged as auto-resolved
//!    - [`ConflictPolicy::ManualReview`]: nothing is written, logged for review
//! 5. `base > remote`: the device is ahead of the cloud, rolled back; the
//!    cloud state stands

use crate::{
    conflict::{LWW_RESOLVER, ROLLBACK_RESOLVER},
    error::Result,
    ChangeRecord, ChangeResult, ConflictLogEntry, ConflictPolicy, ConflictType, Error, FeedEntry,
    FeedReason, OpType, Resolution, Schema, Side, StoredRecord, Timestamp, Version,
};

/// Device id stamped on writes an operator makes through manual resolution.
pub const CLOUD_DEVICE: &str = "cloud";

/// Everything the store has to persist for one processed change.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Answer returned to the uploading device
    pub result: ChangeResult,
    /// New authoritative state, when it changed
    pub write: Option<StoredRecord>,
    /// Audit entry, for every non-trivial decision
    pub conflict: Option<ConflictLogEntry>,
    /// Change-feed entry for devices to pull
    pub feed: Option<FeedEntry>,
}

impl Outcome {
    fn noop(result: ChangeResult) -> Self {
        Self {
            result,
            write: None,
            conflict: None,
            feed: None,
        }
    }
}

/// The resolver applies per-table policies to incoming changes.
pub struct Resolver<'a> {
    schema: &'a Schema,
}

impl<'a> Resolver<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Resolve one uploaded change against the stored record.
    ///
    /// Fails only when the change does not fit the schema.
    pub fn resolve(
        &self,
        change: &ChangeRecord,
        current: Option<&StoredRecord>,
        now: Timestamp,
    ) -> Result<Outcome> {
        self.schema.validate_change(change)?;
        let remote = current.map_or(0, |r| r.version);
        let base = change.base_version;

        if let Some(stored) = current {
            if stored.is_echo_of(change) {
                return Ok(Outcome::noop(ChangeResult::applied(change, stored.version)));
            }
        }

        if change.version <= base {
            return Ok(self.roll_back(
                change,
                current,
                now,
                format!(
                    "version {} does not advance observed version {}",
                    change.version, base
                ),
            ));
        }

        if base == remote {
            return self.accept(change, current);
        }

        if base > remote {
            return Ok(self.roll_back(
                change,
                current,
                now,
                format!("device observed version {base} but cloud holds {remote}"),
            ));
        }

        // base < remote implies a stored record exists
        let Some(stored) = current else {
            return Err(Error::CorruptionDetected {
                table: change.table_name.clone(),
                record_id: change.record_id.clone(),
                detail: format!("cloud version {remote} without a stored record"),
            });
        };

        match self.schema.policy_for(&change.table_name)? {
            ConflictPolicy::LastWriteWins => self.last_write_wins(change, stored, now),
            ConflictPolicy::ManualReview => Ok(self.hold_for_review(change, stored, now)),
        }
    }

    fn accept(&self, change: &ChangeRecord, current: Option<&StoredRecord>) -> Result<Outcome> {
        let base = current.map_or(0, |r| r.version);
        let record = match current {
            Some(stored) => {
                let mut record = stored.clone();
                record.advance(change)?;
                record
            }
            None => StoredRecord::from_change(change),
        };

        Ok(Outcome {
            result: ChangeResult::applied(change, record.version),
            feed: Some(FeedEntry::from_record(&record, base, FeedReason::Write)),
            write: Some(record),
            conflict: None,
        })
    }

    fn last_write_wins(
        &self,
        change: &ChangeRecord,
        stored: &StoredRecord,
        now: Timestamp,
    ) -> Result<Outcome> {
        let version = change.version.max(stored.version) + 1;
        let winner = if change.stamp().supersedes(&stored.stamp()) {
            Side::Local
        } else {
            Side::Remote
        };

        let mut winning = match winner {
            Side::Local => change.clone(),
            Side::Remote => stored.to_change(stored.version),
        };
        winning.version = version;

        let mut record = stored.clone();
        record.advance(&winning)?;

        let mut entry = self.entry(
            change,
            stored,
            ConflictType::DataConflict,
            Resolution::AutoResolved,
            now,
        );
        entry.winner = Some(winner);
        entry.resolved_by = Some(LWW_RESOLVER.to_string());
        entry.resolved_at = Some(now);

        let reason = FeedReason::AutoResolved {
            conflict_id: entry.conflict_id,
        };
        Ok(Outcome {
            result: ChangeResult::conflict(change, record.version, entry.clone()),
            feed: Some(FeedEntry::from_record(&record, stored.version, reason)),
            write: Some(record),
            conflict: Some(entry),
        })
    }

    fn hold_for_review(
        &self,
        change: &ChangeRecord,
        stored: &StoredRecord,
        now: Timestamp,
    ) -> Outcome {
        let entry = self.entry(
            change,
            stored,
            ConflictType::DataConflict,
            Resolution::ManualReview,
            now,
        );
        Outcome {
            result: ChangeResult::conflict(change, stored.version, entry.clone()),
            write: None,
            conflict: Some(entry),
            feed: None,
        }
    }

    fn roll_back(
        &self,
        change: &ChangeRecord,
        current: Option<&StoredRecord>,
        now: Timestamp,
        message: String,
    ) -> Outcome {
        let remote = current.map_or(0, |r| r.version);
        let mut entry = ConflictLogEntry::new(
            &change.key(),
            change.device_id.clone(),
            ConflictType::VersionMismatch,
            Resolution::RolledBack,
            change.version,
            remote,
            change.payload.clone(),
            current.and_then(|r| r.payload.clone()),
            now,
        )
        .with_error(message);
        entry.winner = Some(Side::Remote);
        entry.resolved_by = Some(ROLLBACK_RESOLVER.to_string());
        entry.resolved_at = Some(now);

        // re-announce the cloud state so the device drops its local edit
        let feed = current.map(|record| {
            FeedEntry::from_record(
                record,
                record.version.saturating_sub(1),
                FeedReason::RolledBack {
                    conflict_id: entry.conflict_id,
                },
            )
        });

        Outcome {
            result: ChangeResult::conflict(change, remote, entry.clone()),
            write: None,
            conflict: Some(entry),
            feed,
        }
    }

    fn entry(
        &self,
        change: &ChangeRecord,
        stored: &StoredRecord,
        conflict_type: ConflictType,
        resolution: Resolution,
        now: Timestamp,
    ) -> ConflictLogEntry {
        ConflictLogEntry::new(
            &change.key(),
            change.device_id.clone(),
            conflict_type,
            resolution,
            change.version,
            stored.version,
            change.payload.clone(),
            stored.payload.clone(),
            now,
        )
    }

    /// Settle a held conflict by writing the chosen side as a new version.
    ///
    /// The entry is only marked resolved once the new state is computed. When
    /// the record moved on after the conflict was logged, the overwritten
    /// version is noted in the entry's `error_message`.
    pub fn resolve_manual(
        &self,
        entry: &mut ConflictLogEntry,
        side: Side,
        resolver: &str,
        current: Option<&StoredRecord>,
        now: Timestamp,
    ) -> Result<(StoredRecord, FeedEntry)> {
        if entry.resolution != Resolution::ManualReview {
            return Err(Error::NotReviewable(entry.conflict_id));
        }
        if entry.resolved_at.is_some() {
            return Err(Error::AlreadyResolved(entry.conflict_id));
        }
        let stored = current.ok_or_else(|| Error::RecordNotFound {
            table: entry.table_name.clone(),
            record_id: entry.record_id.clone(),
        })?;

        let payload = entry.payload_for(side).cloned();
        let op_type = if payload.is_some() {
            OpType::Update
        } else {
            OpType::Delete
        };
        let version: Version = stored.version + 1;
        let mut change = ChangeRecord::new(op_type, entry.key(), CLOUD_DEVICE, version, now)
            .with_user(resolver);
        change.payload = payload;

        let mut record = stored.clone();
        record.advance(&change)?;
        entry.mark_resolved(side, resolver, now)?;
        if stored.version != entry.remote_version {
            entry.error_message = Some(format!(
                "record moved from version {} to {} (last written by {}) while held; \
                 resolution written as version {}",
                entry.remote_version, stored.version, stored.device_id, version
            ));
        }

        let feed = FeedEntry::from_record(
            &record,
            stored.version,
            FeedReason::ManualResolution {
                conflict_id: entry.conflict_id,
            },
        );
        Ok((record, feed))
    }
}

//! MemoryCloud - an in-memory authoritative store.
//!
//! Holds the cloud's records, the processed-change ledger used for
//! idempotency, the sequenced change feed, and the conflict log. The HTTP
//! service keeps the same state in PostgreSQL; this implementation backs
//! tests, benchmarks, and the device client's in-memory transport.

use crate::{
    error::Result, BatchRequest, BatchResponse, ChangeId, ChangeRecord, ChangeResult, ConflictId,
    ConflictLogEntry, ConflictQuery, Error, PullQuery, PullResponse, RecordKey, RemoteChange,
    ResolveResponse, Resolver, Schema, SchemaVersion, Sequence, Side, StoredRecord, Timestamp,
    MAX_PULL_LIMIT,
};
use std::collections::{BTreeMap, HashMap};

/// The cloud's state for one tenant.
#[derive(Debug, Clone)]
pub struct MemoryCloud {
    /// Schema the cloud currently accepts
    schema: Schema,
    /// Authoritative records by key
    records: BTreeMap<RecordKey, StoredRecord>,
    /// Results of changes already processed, by change id
    processed: HashMap<ChangeId, ChangeResult>,
    /// Change feed in sequence order
    feed: Vec<RemoteChange>,
    /// Conflict log in creation order
    conflicts: Vec<ConflictLogEntry>,
    pull_limit_max: usize,
}

impl MemoryCloud {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            records: BTreeMap::new(),
            processed: HashMap::new(),
            feed: Vec::new(),
            conflicts: Vec::new(),
            pull_limit_max: MAX_PULL_LIMIT,
        }
    }

    /// Builder-style override of the largest pull page.
    pub fn with_pull_limit_max(mut self, max: usize) -> Self {
        self.pull_limit_max = max.max(1);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema.version
    }

    /// Replace the accepted schema (a cloud-side migration).
    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = schema;
    }

    /// Process an uploaded batch.
    ///
    /// The schema version and every change are checked before any record is
    /// touched; a bad batch is refused as a whole.
    pub fn apply_batch(&mut self, request: &BatchRequest, now: Timestamp) -> Result<BatchResponse> {
        if request.schema_version != self.schema.version {
            return Err(Error::SchemaMismatch {
                local: request.schema_version,
                remote: self.schema.version,
            });
        }
        for change in &request.changes {
            self.schema.validate_change(change)?;
        }

        let mut results = Vec::with_capacity(request.changes.len());
        for change in &request.changes {
            results.push(self.apply_change(change, now)?);
        }
        Ok(BatchResponse { results })
    }

    /// Process a single change, idempotently by `change_id`.
    pub fn apply_change(&mut self, change: &ChangeRecord, now: Timestamp) -> Result<ChangeResult> {
        if let Some(result) = self.processed.get(&change.change_id) {
            return Ok(result.clone());
        }

        let key = change.key();
        let outcome = Resolver::new(&self.schema).resolve(change, self.records.get(&key), now)?;

        if let Some(record) = outcome.write {
            self.records.insert(key, record);
        }
        if let Some(entry) = outcome.conflict {
            self.conflicts.push(entry);
        }
        if let Some(entry) = outcome.feed {
            let sequence = self.latest_sequence() + 1;
            self.feed.push(entry.sequenced(sequence));
        }
        self.processed
            .insert(change.change_id, outcome.result.clone());
        Ok(outcome.result)
    }

    /// Page through the change feed after `query.since`.
    pub fn pull(&self, query: &PullQuery) -> PullResponse {
        let limit = query.effective_limit(self.pull_limit_max);
        let start = self.feed.partition_point(|c| c.sequence <= query.since);
        let changes: Vec<RemoteChange> = self.feed[start..].iter().take(limit).cloned().collect();
        let next_seq = changes.last().map_or(query.since, |c| c.sequence);
        let has_more = start + changes.len() < self.feed.len();

        PullResponse {
            changes,
            next_seq,
            has_more,
        }
    }

    /// Settle a held conflict with the chosen side.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        side: Side,
        resolver: &str,
        now: Timestamp,
    ) -> Result<ResolveResponse> {
        let index = self
            .conflicts
            .iter()
            .position(|c| c.conflict_id == conflict_id)
            .ok_or(Error::ConflictNotFound(conflict_id))?;

        let mut entry = self.conflicts[index].clone();
        let key = entry.key();
        let (record, feed) = Resolver::new(&self.schema).resolve_manual(
            &mut entry,
            side,
            resolver,
            self.records.get(&key),
            now,
        )?;

        let sequence = self.latest_sequence() + 1;
        self.feed.push(feed.sequenced(sequence));
        self.records.insert(key, record.clone());
        self.conflicts[index] = entry.clone();

        Ok(ResolveResponse {
            conflict: entry,
            record,
        })
    }

    pub fn conflicts(&self, query: &ConflictQuery) -> Vec<ConflictLogEntry> {
        query.select(&self.conflicts).into_iter().cloned().collect()
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Option<&ConflictLogEntry> {
        self.conflicts.iter().find(|c| c.conflict_id == conflict_id)
    }

    pub fn record(&self, key: &RecordKey) -> Option<&StoredRecord> {
        self.records.get(key)
    }

    /// Number of live (not deleted) records.
    pub fn active_count(&self) -> usize {
        self.records.values().filter(|r| r.is_active()).count()
    }

    pub fn latest_sequence(&self) -> Sequence {
        self.feed.last().map_or(0, |c| c.sequence)
    }

    /// Number of changes in the processed ledger.
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FeedReason, OpType, Resolution, ResultStatus, TablePayload};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_706_745_600 + secs, 0).unwrap()
    }

    fn insert(table: &str, id: &str, data: serde_json::Value) -> ChangeRecord {
        ChangeRecord::new(OpType::Insert, RecordKey::new(table, id), "till-1", 1, at(0))
            .with_payload(TablePayload::new(table, data))
    }

    fn batch(changes: Vec<ChangeRecord>) -> BatchRequest {
        BatchRequest {
            device_id: "till-1".into(),
            schema_version: 1,
            changes,
        }
    }

    #[test]
    fn batch_applies_and_feeds() {
        let mut cloud = MemoryCloud::new(Schema::retail());
        let request = batch(vec![
            insert("ingredients", "flour", json!({"name": "Flour"})),
            insert("ingredients", "sugar", json!({"name": "Sugar"})),
        ]);

        let response = cloud.apply_batch(&request, at(1)).unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(response.results.iter().all(|r| r.is_applied()));
        assert_eq!(cloud.active_count(), 2);
        assert_eq!(cloud.latest_sequence(), 2);
    }

    #[test]
    fn resubmitting_a_batch_is_a_noop() {
        let mut cloud = MemoryCloud::new(Schema::retail());
        let request = batch(vec![insert("products", "p-1", json!({"name": "Tea"}))]);

        let first = cloud.apply_batch(&request, at(1)).unwrap();
        let second = cloud.apply_batch(&request, at(2)).unwrap();
        assert_eq!(first, second);
        assert_eq!(cloud.latest_sequence(), 1);
        assert_eq!(cloud.processed_count(), 1);
    }

    #[test]
    fn schema_mismatch_refuses_whole_batch() {
        let mut cloud = MemoryCloud::new(Schema::retail());
        let mut request = batch(vec![insert("products", "p-1", json!({"name": "Tea"}))]);
        request.schema_version = 2;

        assert_eq!(
            cloud.apply_batch(&request, at(1)),
            Err(Error::SchemaMismatch {
                local: 2,
                remote: 1
            })
        );
        assert_eq!(cloud.active_count(), 0);
    }

    #[test]
    fn invalid_change_refuses_whole_batch() {
        let mut cloud = MemoryCloud::new(Schema::retail());
        let request = batch(vec![
            insert("products", "p-1", json!({"name": "Tea"})),
            insert("products", "p-2", json!({"price": 3.5})),
        ]);

        assert!(matches!(
            cloud.apply_batch(&request, at(1)),
            Err(Error::MissingRequiredField(f)) if f == "name"
        ));
        assert_eq!(cloud.active_count(), 0);
    }

    #[test]
    fn pull_pages_through_feed() {
        let mut cloud = MemoryCloud::new(Schema::retail());
        let changes = (0..5)
            .map(|i| insert("categories", &format!("c-{i}"), json!({"name": "Drinks"})))
            .collect();
        cloud.apply_batch(&batch(changes), at(1)).unwrap();

        let page = cloud.pull(&PullQuery::new(0, 2));
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.next_seq, 2);
        assert!(page.has_more);

        let page = cloud.pull(&PullQuery::new(page.next_seq, 10));
        assert_eq!(page.changes.len(), 3);
        assert_eq!(page.next_seq, 5);
        assert!(!page.has_more);

        let empty = cloud.pull(&PullQuery::new(5, 10));
        assert!(empty.changes.is_empty());
        assert_eq!(empty.next_seq, 5);
    }

    #[test]
    fn held_conflict_resolves_through_feed() {
        let mut cloud = MemoryCloud::new(Schema::retail());
        let base = insert("transactions", "t-1", json!({"amount": 10.0}));
        cloud.apply_change(&base, at(1)).unwrap();

        let key = RecordKey::new("transactions", "t-1");
        let mut a = ChangeRecord::new(OpType::Update, key.clone(), "till-a", 2, at(10));
        a.payload = Some(TablePayload::new("transactions", json!({"amount": 12.0})));
        let mut b = ChangeRecord::new(OpType::Update, key.clone(), "till-b", 2, at(20));
        b.payload = Some(TablePayload::new("transactions", json!({"amount": 15.0})));

        cloud.apply_change(&a, at(30)).unwrap();
        let held = cloud.apply_change(&b, at(31)).unwrap();
        assert_eq!(held.status, ResultStatus::Conflict);
        assert_eq!(held.resolution, Some(Resolution::ManualReview));

        let conflict_id = held.conflict_id.unwrap();
        assert_eq!(cloud.conflicts(&ConflictQuery::open()).len(), 1);

        let response = cloud
            .resolve_conflict(conflict_id, Side::Local, "manager-1", at(60))
            .unwrap();
        assert_eq!(response.record.version, 3);
        assert_eq!(cloud.record(&key).unwrap().version, 3);
        assert!(cloud.conflicts(&ConflictQuery::open()).is_empty());

        let last = cloud.pull(&PullQuery::new(2, 10));
        assert_eq!(
            last.changes[0].reason,
            FeedReason::ManualResolution { conflict_id }
        );

        assert_eq!(
            cloud.resolve_conflict(conflict_id, Side::Remote, "manager-2", at(61)),
            Err(Error::AlreadyResolved(conflict_id))
        );
        let unknown = uuid::Uuid::new_v4();
        assert_eq!(
            cloud.resolve_conflict(unknown, Side::Remote, "manager-2", at(61)),
            Err(Error::ConflictNotFound(unknown))
        );
    }
}

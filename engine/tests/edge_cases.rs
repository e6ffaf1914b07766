//! Edge case tests for tillsync-engine
//!
//! These tests cover boundary conditions of the resolver and the in-memory
//! cloud store.

use chrono::{TimeZone, Utc};
use serde_json::json;
use tillsync_engine::{
    BatchRequest, ChangeRecord, ConflictQuery, ConflictType, Error, FeedReason, FieldDef,
    FieldType, MemoryCloud, OpType, PullQuery, RecordKey, Resolution, Schema, TablePayload,
    TableSchema, Timestamp,
};

fn at(secs: i64) -> Timestamp {
    Utc.timestamp_opt(1_706_745_600 + secs, 0).unwrap()
}

fn create_test_schema() -> Schema {
    Schema::new(1)
        .with_table(TableSchema::new(
            "items",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("count", FieldType::Int),
                FieldDef::optional("data", FieldType::Json),
            ],
        ))
        .with_table(
            TableSchema::new("ledger", vec![FieldDef::required("amount", FieldType::Float)])
                .critical(),
        )
}

fn change(
    table: &str,
    id: &str,
    device: &str,
    op: OpType,
    version: u64,
    secs: i64,
    data: Option<serde_json::Value>,
) -> ChangeRecord {
    let mut change = ChangeRecord::new(op, RecordKey::new(table, id), device, version, at(secs));
    change.payload = data.map(|d| TablePayload::new(table, d));
    change
}

fn upload(cloud: &mut MemoryCloud, device: &str, changes: Vec<ChangeRecord>) {
    let request = BatchRequest {
        device_id: device.to_string(),
        schema_version: cloud.schema_version(),
        changes,
    };
    cloud.apply_batch(&request, at(1_000)).unwrap();
}

// ============================================================================
// Payload Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let insert = change("items", "i-1", "till-1", OpType::Insert, 1, 0, Some(json!({"name": ""})));

    upload(&mut cloud, "till-1", vec![insert]);

    let record = cloud.record(&RecordKey::new("items", "i-1")).unwrap();
    assert_eq!(record.payload.as_ref().unwrap().data["name"], "");
}

#[test]
fn unicode_strings_survive_the_feed() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let names = ["日本語テスト", "Привет мир", "مرحبا بالعالم", "🎉🚀💯", "Hello\nWorld\tTab"];

    let changes = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            change(
                "items",
                &format!("i-{i}"),
                "till-1",
                OpType::Insert,
                1,
                0,
                Some(json!({ "name": name })),
            )
        })
        .collect();
    upload(&mut cloud, "till-1", changes);

    let page = cloud.pull(&PullQuery::new(0, 100));
    let pulled: Vec<&str> = page
        .changes
        .iter()
        .map(|c| c.change.payload.as_ref().unwrap().data["name"].as_str().unwrap())
        .collect();
    assert_eq!(pulled, names);
}

#[test]
fn deeply_nested_json() {
    let mut nested = json!({"leaf": true});
    for _ in 0..50 {
        nested = json!({ "inner": nested });
    }
    let mut cloud = MemoryCloud::new(create_test_schema());
    let insert = change(
        "items",
        "i-1",
        "till-1",
        OpType::Insert,
        1,
        0,
        Some(json!({"name": "deep", "data": nested.clone()})),
    );
    upload(&mut cloud, "till-1", vec![insert]);

    let record = cloud.record(&RecordKey::new("items", "i-1")).unwrap();
    assert_eq!(record.payload.as_ref().unwrap().data["data"], nested);
}

#[test]
fn non_object_payload_is_rejected() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let insert = change("items", "i-1", "till-1", OpType::Insert, 1, 0, Some(json!([1, 2])));
    let request = BatchRequest {
        device_id: "till-1".into(),
        schema_version: 1,
        changes: vec![insert],
    };
    assert!(matches!(
        cloud.apply_batch(&request, at(1)),
        Err(Error::InvalidPayload(_))
    ));
}

// ============================================================================
// Version Edge Cases
// ============================================================================

#[test]
fn zero_version_is_rejected() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let bad = change("items", "i-1", "till-1", OpType::Insert, 0, 0, Some(json!({"name": "x"})));
    assert!(cloud.apply_change(&bad, at(1)).is_err());
    assert_eq!(cloud.latest_sequence(), 0);
}

#[test]
fn rapid_sequential_updates_same_record() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    upload(
        &mut cloud,
        "till-1",
        vec![change("items", "i-1", "till-1", OpType::Insert, 1, 0, Some(json!({"name": "v1"})))],
    );

    for version in 2..=100u64 {
        let update = change(
            "items",
            "i-1",
            "till-1",
            OpType::Update,
            version,
            version as i64,
            Some(json!({"name": format!("v{version}")})),
        );
        let result = cloud.apply_change(&update, at(1_000)).unwrap();
        assert!(result.is_applied());
        assert_eq!(result.version, version);
    }

    let record = cloud.record(&RecordKey::new("items", "i-1")).unwrap();
    assert_eq!(record.version, 100);
    assert!(cloud.conflicts(&ConflictQuery::new()).is_empty());
}

#[test]
fn skewed_clock_never_moves_last_modified_backwards() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let key = RecordKey::new("items", "i-1");
    cloud
        .apply_change(
            &change("items", "i-1", "till-1", OpType::Insert, 1, 500, Some(json!({"name": "a"}))),
            at(501),
        )
        .unwrap();
    cloud
        .apply_change(
            &change("items", "i-1", "till-2", OpType::Update, 2, 100, Some(json!({"name": "b"}))),
            at(502),
        )
        .unwrap();

    let record = cloud.record(&key).unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.last_modified, at(500));
}

// ============================================================================
// Delete Edge Cases
// ============================================================================

#[test]
fn delete_then_concurrent_update_resolves_by_time() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    upload(
        &mut cloud,
        "till-a",
        vec![change("items", "i-1", "till-a", OpType::Insert, 1, 0, Some(json!({"name": "x"})))],
    );

    cloud
        .apply_change(&change("items", "i-1", "till-a", OpType::Delete, 2, 10, None), at(20))
        .unwrap();
    let y = Some(json!({"name": "y"}));
    let late_update = change("items", "i-1", "till-b", OpType::Update, 2, 15, y);
    let result = cloud.apply_change(&late_update, at(21)).unwrap();

    assert_eq!(result.resolution, Some(Resolution::AutoResolved));
    let record = cloud.record(&RecordKey::new("items", "i-1")).unwrap();
    assert_eq!(record.version, 3);
    assert!(record.is_active());
    assert_eq!(record.payload.as_ref().unwrap().data["name"], "y");
}

#[test]
fn deleting_a_never_synced_record_leaves_a_tombstone() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let delete = change("items", "ghost", "till-a", OpType::Delete, 1, 0, None);
    assert!(cloud.apply_change(&delete, at(1)).unwrap().is_applied());

    let record = cloud.record(&RecordKey::new("items", "ghost")).unwrap();
    assert!(record.deleted);
    assert_eq!(cloud.active_count(), 0);
    let feed = cloud.pull(&PullQuery::new(0, 10));
    assert_eq!(feed.changes[0].change.op_type, OpType::Delete);
}

// ============================================================================
// Conflict Edge Cases
// ============================================================================

#[test]
fn three_devices_on_master_data_log_two_conflicts() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    upload(
        &mut cloud,
        "till-a",
        vec![change("items", "i-1", "till-a", OpType::Insert, 1, 0, Some(json!({"name": "x"})))],
    );

    for (secs, device) in [(30, "till-a"), (10, "till-b"), (20, "till-c")] {
        let edit = change(
            "items",
            "i-1",
            device,
            OpType::Update,
            2,
            secs,
            Some(json!({ "name": device })),
        );
        cloud.apply_change(&edit, at(100)).unwrap();
    }

    let record = cloud.record(&RecordKey::new("items", "i-1")).unwrap();
    assert_eq!(record.payload.as_ref().unwrap().data["name"], "till-a");
    assert_eq!(record.version, 4);

    let logged = cloud.conflicts(&ConflictQuery::new().resolution(Resolution::AutoResolved));
    assert_eq!(logged.len(), 2);
    assert!(logged
        .iter()
        .all(|e| e.conflict_type == ConflictType::DataConflict));
}

#[test]
fn rollback_without_cloud_record_feeds_nothing() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let amount = Some(json!({"amount": 1.0}));
    let orphan = change("ledger", "l-1", "till-a", OpType::Update, 5, 0, amount);

    let result = cloud.apply_change(&orphan, at(1)).unwrap();
    assert_eq!(result.resolution, Some(Resolution::RolledBack));
    assert_eq!(result.version, 0);
    assert_eq!(cloud.latest_sequence(), 0);
}

#[test]
fn held_conflicts_do_not_block_other_records() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    let amount = Some(json!({"amount": 1.0}));
    let base = change("ledger", "l-1", "till-a", OpType::Insert, 1, 0, amount);
    upload(&mut cloud, "till-a", vec![base]);

    cloud
        .apply_change(
            &change("ledger", "l-1", "till-a", OpType::Update, 2, 5, Some(json!({"amount": 2.0}))),
            at(10),
        )
        .unwrap();
    let held = cloud
        .apply_change(
            &change("ledger", "l-1", "till-b", OpType::Update, 2, 6, Some(json!({"amount": 3.0}))),
            at(11),
        )
        .unwrap();
    assert_eq!(held.resolution, Some(Resolution::ManualReview));

    let amount = Some(json!({"amount": 9.0}));
    let other = change("ledger", "l-2", "till-b", OpType::Insert, 1, 7, amount);
    assert!(cloud.apply_change(&other, at(12)).unwrap().is_applied());
    assert_eq!(cloud.conflicts(&ConflictQuery::open()).len(), 1);
}

// ============================================================================
// Feed Edge Cases
// ============================================================================

#[test]
fn pull_limit_is_capped_by_cloud() {
    let mut cloud = MemoryCloud::new(create_test_schema()).with_pull_limit_max(3);
    let changes = (0..10)
        .map(|i| {
            let name = Some(json!({"name": "n"}));
            change("items", &format!("i-{i}"), "till-1", OpType::Insert, 1, 0, name)
        })
        .collect();
    upload(&mut cloud, "till-1", changes);

    let page = cloud.pull(&PullQuery::new(0, 1_000));
    assert_eq!(page.changes.len(), 3);
    assert!(page.has_more);
}

#[test]
fn auto_resolution_is_announced_as_override() {
    let mut cloud = MemoryCloud::new(create_test_schema());
    upload(
        &mut cloud,
        "till-a",
        vec![change("items", "i-1", "till-a", OpType::Insert, 1, 0, Some(json!({"name": "x"})))],
    );
    let a = change("items", "i-1", "till-a", OpType::Update, 2, 5, Some(json!({"name": "a"})));
    cloud.apply_change(&a, at(6)).unwrap();
    let since = cloud.latest_sequence();
    let b = change("items", "i-1", "till-b", OpType::Update, 2, 9, Some(json!({"name": "b"})));
    cloud.apply_change(&b, at(10)).unwrap();

    let page = cloud.pull(&PullQuery::new(since, 10));
    assert_eq!(page.changes.len(), 1);
    assert!(matches!(page.changes[0].reason, FeedReason::AutoResolved { .. }));
    assert_eq!(page.changes[0].change.version, 3);
    assert_eq!(page.changes[0].change.base_version, 2);
}

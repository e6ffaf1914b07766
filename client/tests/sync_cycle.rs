//! End-to-end sync cycles between devices and an in-process cloud.

use serde_json::json;
use std::time::Duration;
use tillsync_client::{
    db, ClientConfig, ClientError, ConflictQuery, LeaseLock, MemoryTransport, OpType, Resolution,
    Schema, Side, SyncColor, SyncService,
};
use tillsync_engine::{
    ConflictType, MemoryCloud, QueueStatus, RecordKey, StoredRecord, SyncQueueEntry,
};

type Device = SyncService<MemoryTransport>;

fn cloud() -> MemoryTransport {
    MemoryTransport::new(MemoryCloud::new(Schema::retail()))
}

fn config(device_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new(device_id).with_server("memory://cloud", None);
    config.backoff_base = Duration::from_millis(1);
    config.backoff_cap = Duration::from_millis(5);
    config
}

async fn device_with(config: ClientConfig, transport: MemoryTransport) -> Device {
    let pool = db::memory_pool().await.unwrap();
    SyncService::open(config, Schema::retail(), pool, transport)
        .await
        .unwrap()
}

async fn device(device_id: &str, transport: MemoryTransport) -> Device {
    device_with(config(device_id), transport).await
}

async fn local(device: &Device, table: &str, record_id: &str) -> StoredRecord {
    let mut conn = device.pool().acquire().await.unwrap();
    db::load_record(&mut conn, &RecordKey::new(table, record_id))
        .await
        .unwrap()
        .unwrap()
}

async fn entries(device: &Device, status: QueueStatus) -> Vec<SyncQueueEntry> {
    device.client().queue().entries(Some(status)).await.unwrap()
}

fn name_of(record: &StoredRecord) -> String {
    record.payload.as_ref().unwrap().data["name"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn wait_for_backoff() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn ingredient_created_offline_reaches_cloud() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;

    let version = till
        .submit_change(
            "ingredients",
            "flour",
            OpType::Insert,
            Some(json!({"name": "Flour", "unit": "kg"})),
        )
        .await
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(till.sync_state().await.unwrap().color, SyncColor::Yellow);

    let report = till.sync_now().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.per_table["ingredients"], 1);

    let stored = link
        .with_cloud(|c| c.record(&RecordKey::new("ingredients", "flour")).cloned())
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.device_id, "till-a");

    let state = till.sync_state().await.unwrap();
    assert_eq!(state.color, SyncColor::Green);
    assert_eq!(state.pending_count, 0);
    assert_eq!(state.last_acked_sequence, 1);
    assert!(state.last_sync_at.is_some());
    assert!(till.list_conflicts(&ConflictQuery::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_ingredient_edits_resolve_last_write_wins() {
    let link = cloud();
    let a = device("till-a", link.attach()).await;
    let b = device("till-b", link.attach()).await;

    a.submit_change("ingredients", "flour", OpType::Insert, Some(json!({"name": "Flour"})))
        .await
        .unwrap();
    a.sync_now().await.unwrap();
    b.sync_now().await.unwrap();
    assert_eq!(local(&b, "ingredients", "flour").await.version, 1);

    // both terminals edit while offline; b edits last
    a.submit_change("ingredients", "flour", OpType::Update, Some(json!({"name": "Flour T45"})))
        .await
        .unwrap();
    b.submit_change("ingredients", "flour", OpType::Update, Some(json!({"name": "Flour T55"})))
        .await
        .unwrap();

    let report_a = a.sync_now().await.unwrap();
    assert_eq!(report_a.applied, 1);
    let report_b = b.sync_now().await.unwrap();
    assert_eq!(report_b.auto_resolved, 1);

    let stored = link
        .with_cloud(|c| c.record(&RecordKey::new("ingredients", "flour")).cloned())
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(name_of(&stored), "Flour T55");

    let conflicts = link
        .with_cloud(|c| c.conflicts(&ConflictQuery::new()))
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.resolution, Resolution::AutoResolved);
    assert_eq!(conflict.winner, Some(Side::Local));
    assert_eq!(conflict.local_data.as_ref().unwrap().data["name"], "Flour T55");
    assert_eq!(conflict.remote_data.as_ref().unwrap().data["name"], "Flour T45");

    // the device that lost converges on its next pull
    a.sync_now().await.unwrap();
    let converged = local(&a, "ingredients", "flour").await;
    assert_eq!(converged.version, 3);
    assert_eq!(name_of(&converged), "Flour T55");
    assert_eq!(local(&b, "ingredients", "flour").await.version, 3);

    // b mirrored the entry for offline listing
    let mirrored = b.list_conflicts(&ConflictQuery::new()).await.unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].conflict_id, conflict.conflict_id);
}

#[tokio::test]
async fn sale_transaction_conflict_waits_for_manual_review() {
    let link = cloud();
    let a = device("till-a", link.attach()).await;
    let b = device("till-b", link.attach()).await;

    a.submit_change("transactions", "t-1", OpType::Insert, Some(json!({"amount": 20.0})))
        .await
        .unwrap();
    a.sync_now().await.unwrap();
    b.sync_now().await.unwrap();

    a.submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 18.0})))
        .await
        .unwrap();
    b.submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 22.5})))
        .await
        .unwrap();
    a.sync_now().await.unwrap();
    let report = b.sync_now().await.unwrap();
    assert_eq!(report.held, 1);

    // the cloud keeps a's version untouched
    let key = RecordKey::new("transactions", "t-1");
    let stored = link.with_cloud(|c| c.record(&key).cloned()).unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.payload.as_ref().unwrap().data["amount"], 18.0);

    let open = b.list_conflicts(&ConflictQuery::open()).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].resolution, Resolution::ManualReview);
    assert_eq!(entries(&b, QueueStatus::Conflict).await.len(), 1);

    let state = b.sync_state().await.unwrap();
    assert_eq!(state.color, SyncColor::Red);
    assert_eq!(state.open_conflicts, 1);

    let err = b
        .submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 1.0})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Engine(tillsync_engine::Error::RecordLocked { .. })
    ));

    // more cycles never auto-apply the held change
    b.sync_now().await.unwrap();
    let stored = link.with_cloud(|c| c.record(&key).cloned()).unwrap().unwrap();
    assert_eq!(stored.version, 2);

    let resolved = b
        .resolve_conflict(open[0].conflict_id, Side::Local, "manager-1")
        .await
        .unwrap();
    assert_eq!(resolved.record.version, 3);
    assert_eq!(resolved.conflict.resolved_by.as_deref(), Some("manager-1"));
    assert_eq!(local(&b, "transactions", "t-1").await.version, 3);
    assert!(entries(&b, QueueStatus::Conflict).await.is_empty());
    assert_eq!(b.sync_state().await.unwrap().open_conflicts, 0);

    a.sync_now().await.unwrap();
    let converged = local(&a, "transactions", "t-1").await;
    assert_eq!(converged.version, 3);
    assert_eq!(converged.payload.as_ref().unwrap().data["amount"], 22.5);

    // resolving again is refused by the cloud
    assert!(b
        .resolve_conflict(open[0].conflict_id, Side::Remote, "manager-2")
        .await
        .is_err());

    let version = b
        .submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 23.0})))
        .await
        .unwrap();
    assert_eq!(version, 4);
    let report = b.sync_now().await.unwrap();
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn network_drop_mid_upload_resends_whole_batch() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;

    for i in 0..100 {
        till.submit_change(
            "products",
            &format!("p-{i:03}"),
            OpType::Insert,
            Some(json!({"name": format!("Product {i}"), "price": 2.5})),
        )
        .await
        .unwrap();
    }

    link.fail_next_upload_after(40);
    let err = till.sync_now().await.unwrap_err();
    assert!(err.is_retryable());

    assert_eq!(link.with_cloud(|c| c.active_count()).unwrap(), 40);
    let state = till.client().state().load().await.unwrap();
    assert_eq!(state.last_acked_sequence, 0);
    assert!(state.last_successful_sync_at.is_none());
    assert_eq!(entries(&till, QueueStatus::Failed).await.len(), 100);
    assert!(entries(&till, QueueStatus::Acked).await.is_empty());

    wait_for_backoff().await;
    let report = till.sync_now().await.unwrap();
    assert_eq!(report.uploaded, 100);
    assert_eq!(report.applied, 100);

    assert_eq!(link.changes_sent(), 200);
    link.with_cloud(|c| {
        assert_eq!(c.active_count(), 100);
        assert_eq!(c.processed_count(), 100);
        assert_eq!(c.latest_sequence(), 100);
        assert!(c.conflicts(&ConflictQuery::new()).is_empty());
    })
    .unwrap();

    assert_eq!(db::active_records(till.pool(), "products").await.unwrap().len(), 100);
    assert_eq!(entries(&till, QueueStatus::Acked).await.len(), 100);
    let state = till.sync_state().await.unwrap();
    assert_eq!(state.last_acked_sequence, 100);
    assert_eq!(state.color, SyncColor::Green);
}

#[tokio::test]
async fn stale_schema_aborts_before_upload() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;
    link.with_cloud(|c| {
        let mut upgraded = Schema::retail();
        upgraded.version = 2;
        c.set_schema(upgraded);
    })
    .unwrap();

    till.submit_change("customers", "c-1", OpType::Insert, Some(json!({"name": "Ada"})))
        .await
        .unwrap();
    let err = till.sync_now().await.unwrap_err();
    assert!(err.is_schema_mismatch());

    assert_eq!(link.upload_count(), 0);
    assert_eq!(link.changes_sent(), 0);
    assert_eq!(entries(&till, QueueStatus::Pending).await.len(), 1);

    let state = till.sync_state().await.unwrap();
    assert_eq!(state.color, SyncColor::Red);
    assert_eq!(state.last_acked_sequence, 0);
    assert!(state.last_error.unwrap().contains("schema version mismatch"));

    // the device keeps working offline
    let version = till
        .submit_change("customers", "c-1", OpType::Update, Some(json!({"name": "Ada L."})))
        .await
        .unwrap();
    assert_eq!(version, 2);
}

#[tokio::test]
async fn lost_response_is_not_applied_twice() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;
    till.submit_change("categories", "drinks", OpType::Insert, Some(json!({"name": "Drinks"})))
        .await
        .unwrap();

    link.drop_next_response();
    assert!(till.sync_now().await.is_err());
    assert_eq!(till.client().state().load().await.unwrap().last_acked_sequence, 0);

    wait_for_backoff().await;
    let report = till.sync_now().await.unwrap();
    assert_eq!(report.applied, 1);

    link.with_cloud(|c| {
        assert_eq!(c.processed_count(), 1);
        assert_eq!(c.latest_sequence(), 1);
        assert_eq!(
            c.record(&RecordKey::new("categories", "drinks")).unwrap().version,
            1
        );
        assert!(c.conflicts(&ConflictQuery::new()).is_empty());
    })
    .unwrap();
}

#[tokio::test]
async fn edit_after_lost_response_follows_as_its_own_change() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;
    till.submit_change("transactions", "t-1", OpType::Insert, Some(json!({"amount": 10.0})))
        .await
        .unwrap();
    till.sync_now().await.unwrap();

    till.submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 12.0})))
        .await
        .unwrap();
    link.drop_next_response();
    assert!(till.sync_now().await.is_err());
    assert_eq!(entries(&till, QueueStatus::Failed).await.len(), 1);

    // the cloud already holds v2; v3 must not be folded into it
    let version = till
        .submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 14.0})))
        .await
        .unwrap();
    assert_eq!(version, 3);
    let queued = entries(&till, QueueStatus::Pending).await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].change.base_version, 2);

    wait_for_backoff().await;
    let report = till.sync_now().await.unwrap();
    assert_eq!(report.held, 0);
    assert_eq!(report.applied, 2);

    let stored = link
        .with_cloud(|c| c.record(&RecordKey::new("transactions", "t-1")).cloned())
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.payload.unwrap().data["amount"], 14.0);
    assert!(link
        .with_cloud(|c| c.conflicts(&ConflictQuery::new()))
        .unwrap()
        .is_empty());

    // nothing is locked
    till.submit_change("transactions", "t-1", OpType::Update, Some(json!({"amount": 15.0})))
        .await
        .unwrap();
    assert_eq!(till.sync_now().await.unwrap().applied, 1);
}

#[tokio::test]
async fn record_syncs_again_after_abandonment() {
    let link = cloud();
    let mut cfg = config("till-a");
    cfg.max_attempts = 2;
    let till = device_with(cfg, link.clone()).await;
    till.submit_change("products", "p-1", OpType::Insert, Some(json!({"name": "Tea"})))
        .await
        .unwrap();

    link.fail_next_upload_after(0);
    assert!(till.sync_now().await.is_err());
    wait_for_backoff().await;
    link.fail_next_upload_after(0);
    assert!(till.sync_now().await.is_err());
    assert_eq!(entries(&till, QueueStatus::Abandoned).await.len(), 1);

    till.submit_change("products", "p-1", OpType::Update, Some(json!({"name": "Tea XL"})))
        .await
        .unwrap();
    let report = till.sync_now().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.abandoned, 0);

    let stored = link
        .with_cloud(|c| c.record(&RecordKey::new("products", "p-1")).cloned())
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(name_of(&stored), "Tea XL");
    assert_eq!(local(&till, "products", "p-1").await.version, 2);

    // and keeps syncing sequentially afterwards
    till.submit_change("products", "p-1", OpType::Update, Some(json!({"name": "Tea XXL"})))
        .await
        .unwrap();
    assert_eq!(till.sync_now().await.unwrap().applied, 1);
    assert!(link
        .with_cloud(|c| c.conflicts(&ConflictQuery::new()))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn exhausted_retries_abandon_and_log_failure() {
    let link = cloud();
    let mut cfg = config("till-a");
    cfg.max_attempts = 2;
    let till = device_with(cfg, link.clone()).await;
    till.submit_change("products", "p-1", OpType::Insert, Some(json!({"name": "Tea"})))
        .await
        .unwrap();

    link.fail_next_upload_after(0);
    assert!(till.sync_now().await.is_err());
    wait_for_backoff().await;
    link.fail_next_upload_after(0);
    assert!(till.sync_now().await.is_err());

    assert_eq!(entries(&till, QueueStatus::Abandoned).await.len(), 1);
    let failures = till
        .list_conflicts(&ConflictQuery::new().resolution(Resolution::RolledBack))
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].conflict_type, ConflictType::SyncFailure);

    let state = till.sync_state().await.unwrap();
    assert_eq!(state.abandoned_count, 1);
    assert_eq!(state.pending_count, 0);
    assert_eq!(state.color, SyncColor::Red);
}

#[tokio::test]
async fn device_ahead_of_cloud_is_rolled_back() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;
    till.submit_change("products", "p-1", OpType::Insert, Some(json!({"name": "Mocha"})))
        .await
        .unwrap();
    till.sync_now().await.unwrap();

    // the cloud lost the record
    link.with_cloud(|c| *c = MemoryCloud::new(Schema::retail()))
        .unwrap();
    till.submit_change("products", "p-1", OpType::Update, Some(json!({"name": "Mocha XL"})))
        .await
        .unwrap();

    let report = till.sync_now().await.unwrap();
    assert_eq!(report.abandoned, 1);

    let abandoned = entries(&till, QueueStatus::Abandoned).await;
    assert!(abandoned[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("corruption detected"));
    let logged = till
        .list_conflicts(&ConflictQuery::new().table("products"))
        .await
        .unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].conflict_type, ConflictType::VersionMismatch);
    assert_eq!(till.sync_state().await.unwrap().color, SyncColor::Red);

    // the next edit is based on what the cloud holds and goes through
    till.submit_change("products", "p-1", OpType::Update, Some(json!({"name": "Mocha XXL"})))
        .await
        .unwrap();
    let report = till.sync_now().await.unwrap();
    assert_eq!(report.applied, 1);
    let stored = link
        .with_cloud(|c| c.record(&RecordKey::new("products", "p-1")).cloned())
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(name_of(&stored), "Mocha XXL");
}

#[tokio::test]
async fn held_lease_skips_cycle() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;
    till.submit_change("products", "p-1", OpType::Insert, Some(json!({"name": "Scone"})))
        .await
        .unwrap();

    let other = LeaseLock::new(till.pool().clone(), "other-process", Duration::from_secs(60));
    other.acquire(db::now()).await.unwrap();

    let err = till.client().run_cycle().await.unwrap_err();
    assert!(err.is_lock_held());
    assert_eq!(link.upload_count(), 0);
    assert_eq!(entries(&till, QueueStatus::Pending).await.len(), 1);

    other.release().await.unwrap();
    assert_eq!(till.client().run_cycle().await.unwrap().applied, 1);
}

#[tokio::test]
async fn offline_device_stays_usable() {
    let link = cloud();
    let till = device("till-a", link.clone()).await;
    link.set_offline(true);

    till.submit_change("products", "p-1", OpType::Insert, Some(json!({"name": "Bagel"})))
        .await
        .unwrap();
    let err = till.sync_now().await.unwrap_err();
    assert!(err.is_retryable());

    // nothing was attempted, so nothing backs off
    assert_eq!(entries(&till, QueueStatus::Pending).await.len(), 1);
    let state = till.sync_state().await.unwrap();
    assert_eq!(state.color, SyncColor::Yellow);
    assert_eq!(state.status, tillsync_engine::DeviceStatus::Offline);

    link.set_offline(false);
    assert_eq!(till.sync_now().await.unwrap().applied, 1);
    assert_eq!(till.sync_state().await.unwrap().color, SyncColor::Green);
}

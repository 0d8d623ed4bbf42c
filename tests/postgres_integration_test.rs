//! PostgreSQL store tests.
//!
//! Exercise the storage-evaluated guards, bulk writes, the fixer scan and
//! checkpoint persistence against a real database.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test -- --ignored`

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use atomic_readmodel::infra::{
    FaultMarker, InMemoryEventLog, PgCheckpointStore, PgDocumentStore, VersionUpdate,
    WriteGuard, WriteOperation,
};
use atomic_readmodel::{
    AtomicReadModel, CancellationToken, CheckpointManager, CheckpointRecord, CheckpointStore,
    CollectionWrapper, DocumentStore, LiveProcessor, ProjectionConfig, ProjectionError,
    SignatureFixer,
};

use common::{OrderEvent, OrderSummaryV1, OrderSummaryV2};

// ============================================================================
// Test Helpers
// ============================================================================

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .ok()?;
    Some(pool)
}

/// Configuration whose collections are private to one test
fn isolated_config() -> ProjectionConfig {
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    ProjectionConfig::default().with_collection_prefix(format!("rm_t{}_", suffix))
}

async fn drop_collection(pool: &sqlx::PgPool, collection: &str) {
    let _ = sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", collection))
        .execute(pool)
        .await;
}

fn model_at(id: &str, version: i64) -> AtomicReadModel<OrderSummaryV1> {
    let mut model = AtomicReadModel::new(id);
    for v in 1..=version {
        model
            .process_changeset(&atomic_readmodel::Changeset::new(
                id,
                v,
                v * 10,
                Utc.timestamp_opt(1_700_000_000 + v, 0).unwrap(),
                vec![OrderEvent::item("sku", 1)],
            ))
            .unwrap();
    }
    model
}

// ============================================================================
// Document store
// ============================================================================

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_guards_are_evaluated_by_the_database() {
    let Some(pool) = connect_db().await else {
        return;
    };
    let store = PgDocumentStore::new(pool.clone());
    let collection = isolated_config().collection_name("order_summary");
    store.ensure_collection(&collection).await.unwrap();

    let v5 = model_at("a", 5).to_document().unwrap();
    store.insert(&collection, &v5).await.unwrap();

    let err = store.insert(&collection, &v5).await.unwrap_err();
    assert!(matches!(err, ProjectionError::DuplicateKey { .. }));
    assert!(err.is_transient());

    let v4 = model_at("a", 4).to_document().unwrap();
    assert!(!store
        .replace_if(&collection, &v4, WriteGuard::checked(&v4.version()))
        .await
        .unwrap());
    assert!(store
        .replace_if(&collection, &v4, WriteGuard::force(&v4.version()))
        .await
        .unwrap());

    let stored = store.find_by_id(&collection, "a").await.unwrap().unwrap();
    assert_eq!(stored, v4);

    let mut bumped = v4.clone();
    bumped.state.readmodel_version = 2;
    assert!(store
        .replace_if(&collection, &bumped, WriteGuard::checked(&bumped.version()))
        .await
        .unwrap());
    assert!(!store
        .replace_if(&collection, &v5, WriteGuard::force(&v5.version()))
        .await
        .unwrap());

    drop_collection(&pool, &collection).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_version_update_and_bulk_write() {
    let Some(pool) = connect_db().await else {
        return;
    };
    let store = PgDocumentStore::new(pool.clone());
    let collection = isolated_config().collection_name("order_summary");
    store.ensure_collection(&collection).await.unwrap();

    for document in [model_at("a", 1), model_at("c", 1), model_at("d", 5)] {
        store
            .insert(&collection, &document.to_document().unwrap())
            .await
            .unwrap();
    }

    let a3 = model_at("a", 3);
    let c4 = model_at("c", 4).to_document().unwrap();
    let d2 = model_at("d", 2).to_document().unwrap();
    let e1 = model_at("e", 1).to_document().unwrap();
    let result = store
        .bulk_write(
            &collection,
            vec![
                WriteOperation::Insert(model_at("a", 2).to_document().unwrap()),
                WriteOperation::Insert(model_at("b", 2).to_document().unwrap()),
                WriteOperation::Replace {
                    guard: WriteGuard::checked(&c4.version()),
                    document: c4.clone(),
                },
                WriteOperation::UpdateVersion(VersionUpdate::from_state(a3.state())),
                WriteOperation::Replace {
                    guard: WriteGuard::checked(&d2.version()),
                    document: d2,
                },
                WriteOperation::Replace {
                    guard: WriteGuard::force(&e1.version()),
                    document: e1,
                },
            ],
        )
        .await
        .unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(result.modified, 2);
    // d is newer than the candidate; e does not exist
    assert_eq!(result.unmatched, 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].id, "a");
    assert!(result.failures[0].duplicate_key);

    let ids: Vec<String> = ["a", "b", "c", "d", "e"].map(String::from).to_vec();
    let versions = store.find_versions(&collection, &ids).await.unwrap();
    assert_eq!(versions.len(), 4);

    let a = store.find_by_id(&collection, "a").await.unwrap().unwrap();
    assert_eq!(a.state.aggregate_version, 3);
    assert_eq!(a.state.last_processed_versions, vec![1, 2, 3]);
    // business body untouched by the version-only update
    assert_eq!(a.body["item_count"], 1);

    let b = store.find_by_id(&collection, "b").await.unwrap().unwrap();
    assert_eq!(b.state.last_processed_versions, vec![1, 2]);
    let c = store.find_by_id(&collection, "c").await.unwrap().unwrap();
    assert_eq!(c, c4);
    let d = store.find_by_id(&collection, "d").await.unwrap().unwrap();
    assert_eq!(d.state.aggregate_version, 5);

    drop_collection(&pool, &collection).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_fault_marker_requires_unchanged_version() {
    let Some(pool) = connect_db().await else {
        return;
    };
    let store = PgDocumentStore::new(pool.clone());
    let collection = isolated_config().collection_name("order_summary");
    store.ensure_collection(&collection).await.unwrap();

    let v4 = model_at("a", 4).to_document().unwrap();
    store.insert(&collection, &v4).await.unwrap();

    let stale = FaultMarker::new(&model_at("a", 3).version(), &"boom");
    assert!(!store.mark_faulted_if(&collection, &stale).await.unwrap());

    let marker = FaultMarker::new(&v4.version(), &"boom").with_retry_increment();
    assert!(store.mark_faulted_if(&collection, &marker).await.unwrap());

    let stored = store.find_by_id(&collection, "a").await.unwrap().unwrap();
    assert!(stored.state.faulted);
    assert_eq!(stored.state.fault_retry_count, 1);
    assert_eq!(stored.state.last_error.as_deref(), Some("boom"));
    assert_eq!(stored.version(), v4.version());
    assert_eq!(stored.body, v4.body);

    drop_collection(&pool, &collection).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_fixer_upgrades_stale_documents() {
    let Some(pool) = connect_db().await else {
        return;
    };
    let config = isolated_config().with_fixer_page_size(2);
    let store: Arc<PgDocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let log = Arc::new(InMemoryEventLog::<OrderEvent>::new());
    let live = Arc::new(LiveProcessor::<OrderEvent>::from_config(log.clone(), &config));
    let cancel = CancellationToken::none();

    let v1: CollectionWrapper<OrderSummaryV1> =
        CollectionWrapper::new(store.clone(), live.clone(), &config);
    v1.ensure_collection(&cancel).await.unwrap();

    for id in ["a", "b", "c"] {
        log.append(id, vec![OrderEvent::placed("c")]).await;
        log.append(id, vec![OrderEvent::item("x", 2)]).await;
        v1.find_one_by_id(id, &cancel).await.unwrap().unwrap();
    }

    let fixer = SignatureFixer::new(store.clone(), live.clone(), config.clone());
    let report = fixer.fix::<OrderSummaryV2>(&cancel).await.unwrap();
    assert!(report.completed);
    assert_eq!(report.fixed, 3);

    let stale = store
        .find_stale(v1.collection_name(), 2, i64::MIN, 10)
        .await
        .unwrap();
    assert!(stale.is_empty());

    drop_collection(&pool, v1.collection_name()).await;
}

// ============================================================================
// Checkpoint store
// ============================================================================

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_checkpoints_round_trip() {
    let Some(pool) = connect_db().await else {
        return;
    };
    let store = Arc::new(PgCheckpointStore::new(pool.clone()));
    store.initialize().await.unwrap();
    let cancel = CancellationToken::none();

    let name = format!("order_summary_{}", &Uuid::new_v4().simple().to_string()[..8]);
    let mut record = CheckpointRecord::new(name.clone());
    record.position = 42;
    store.upsert_many(&[record.clone()]).await.unwrap();

    record.position = 77;
    record.catchup_done = true;
    store.upsert_many(&[record.clone()]).await.unwrap();

    // a late flush of an older position never moves the checkpoint back
    record.position = 50;
    store.upsert_many(&[record]).await.unwrap();

    let manager = CheckpointManager::new(store.clone());
    manager.load(&cancel).await.unwrap();
    let loaded = store
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.name == name)
        .unwrap();
    assert_eq!(loaded.position, 77);
    assert!(loaded.catchup_done);

    let _ = sqlx::query("DELETE FROM readmodel_checkpoints WHERE name = $1")
        .bind(&name)
        .execute(&pool)
        .await;
}

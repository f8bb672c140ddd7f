//! Black-box repository tests against a real (in-memory SQLite) pool:
//! exercise `SyncRepository` through its public trait rather than
//! reaching into SQL directly.

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use uuid::Uuid;

use brx_sync::db::repo::{NewInventoryItem, SqlxSyncRepository, SyncRepository};
use brx_sync::db::schema;
use brx_sync::model::OperationType;

async fn setup_db() -> AnyPool {
    sqlx::any::install_default_drivers();
    let db_name = Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{db_name}?mode=memory&cache=shared");
    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn_str)
        .await
        .unwrap();
    schema::migrate(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn try_begin_initial_sync_is_exclusive_unless_forced() {
    let pool = setup_db().await;
    let repo = SqlxSyncRepository::new(std::sync::Arc::new(pool));
    let user_id = Uuid::new_v4();

    repo.upsert_token(user_id, "enc-token").await.unwrap();

    assert!(repo.try_begin_initial_sync(user_id, false).await.unwrap());
    // Already in initial_sync: a second non-forced attempt is rejected.
    assert!(!repo.try_begin_initial_sync(user_id, false).await.unwrap());
    // Forced re-entry succeeds regardless of current state.
    assert!(repo.try_begin_initial_sync(user_id, true).await.unwrap());
}

#[tokio::test]
async fn bulk_insert_then_find_existing_for_chunk_round_trips() {
    let pool = setup_db().await;
    let repo = SqlxSyncRepository::new(std::sync::Arc::new(pool));
    let user_id = Uuid::new_v4();

    let item = NewInventoryItem {
        user_id,
        blueprint_id: 42,
        external_stock_id: Some("abc123".into()),
        quantity: 5,
        price_cents: 999,
        description: None,
        user_data_field: None,
        graded: None,
        properties: None,
    };
    let created = repo.bulk_insert(&[item]).await.unwrap();
    assert_eq!(created, 1);

    let keys = vec![(42i64, Some("abc123".to_string()))];
    let existing = repo.find_existing_for_chunk(user_id, &keys).await.unwrap();
    assert_eq!(existing.len(), 1);
    let found = existing.get(&(42, Some("abc123".to_string()))).unwrap();
    assert_eq!(found.quantity, 5);
}

#[tokio::test]
async fn purchase_reserve_then_commit_decrements_quantity() {
    let pool = setup_db().await;
    let repo = SqlxSyncRepository::new(std::sync::Arc::new(pool));
    let user_id = Uuid::new_v4();

    let item = NewInventoryItem {
        user_id,
        blueprint_id: 1,
        external_stock_id: Some("stock-1".into()),
        quantity: 10,
        price_cents: 500,
        description: None,
        user_data_field: None,
        graded: None,
        properties: None,
    };
    repo.bulk_insert(&[item]).await.unwrap();

    let keys = vec![(1i64, Some("stock-1".to_string()))];
    let existing = repo.find_existing_for_chunk(user_id, &keys).await.unwrap();
    let item_id = existing.values().next().unwrap().id;

    let reservation = repo.purchase_reserve(user_id, item_id).await.unwrap().unwrap();
    assert_eq!(reservation.quantity_before, 10);

    repo.purchase_commit(item_id, reservation.quantity_before, 3)
        .await
        .unwrap();

    let updated = repo.get_item(item_id).await.unwrap().unwrap();
    assert_eq!(updated.quantity, 7);
}

#[tokio::test]
async fn operation_journal_lifecycle() {
    let pool = setup_db().await;
    let repo = SqlxSyncRepository::new(std::sync::Arc::new(pool));
    let user_id = Uuid::new_v4();
    let operation_id = Uuid::new_v4();

    repo.register_pending(operation_id, user_id, OperationType::BulkSync)
        .await
        .unwrap();
    let op = repo.get_operation(operation_id).await.unwrap().unwrap();
    assert_eq!(op.user_id, user_id);

    repo.update_metadata(operation_id, serde_json::json!({"progress_percent": 50}))
        .await
        .unwrap();
    repo.complete_operation(operation_id).await.unwrap();

    let completed = repo.get_operation(operation_id).await.unwrap().unwrap();
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn bulk_insert_folds_conflicting_row_instead_of_failing_chunk() {
    let pool = setup_db().await;
    let repo = SqlxSyncRepository::new(std::sync::Arc::new(pool));
    let user_id = Uuid::new_v4();

    let first = NewInventoryItem {
        user_id,
        blueprint_id: 9,
        external_stock_id: Some("dup-1".into()),
        quantity: 4,
        price_cents: 100,
        description: None,
        user_data_field: None,
        graded: None,
        properties: None,
    };
    let created = repo.bulk_insert(&[first]).await.unwrap();
    assert_eq!(created, 1);

    // Same (user_id, blueprint_id, external_stock_id) arriving from a
    // second chunk must update the existing row, not error out the batch.
    let second = NewInventoryItem {
        user_id,
        blueprint_id: 9,
        external_stock_id: Some("dup-1".into()),
        quantity: 7,
        price_cents: 150,
        description: None,
        user_data_field: None,
        graded: None,
        properties: None,
    };
    let created_again = repo.bulk_insert(&[second]).await.unwrap();
    assert_eq!(created_again, 0, "conflicting row is folded, not re-inserted");

    let keys = vec![(9i64, Some("dup-1".to_string()))];
    let existing = repo.find_existing_for_chunk(user_id, &keys).await.unwrap();
    assert_eq!(existing.len(), 1, "no duplicate row was created");
    let found = existing.get(&(9, Some("dup-1".to_string()))).unwrap();
    assert_eq!(found.quantity, 7);
    assert_eq!(found.price_cents, 150);
}

#[tokio::test]
async fn adjust_quantity_clamps_at_zero() {
    let pool = setup_db().await;
    let repo = SqlxSyncRepository::new(std::sync::Arc::new(pool));
    let user_id = Uuid::new_v4();

    let item = NewInventoryItem {
        user_id,
        blueprint_id: 7,
        external_stock_id: Some("s7".into()),
        quantity: 2,
        price_cents: 100,
        description: None,
        user_data_field: None,
        graded: None,
        properties: None,
    };
    repo.bulk_insert(&[item]).await.unwrap();
    let keys = vec![(7i64, Some("s7".to_string()))];
    let existing = repo.find_existing_for_chunk(user_id, &keys).await.unwrap();
    let item_id = existing.values().next().unwrap().id;

    let after = repo.adjust_quantity(item_id, -10).await.unwrap().unwrap();
    assert_eq!(after.quantity, 0, "quantity must clamp at zero, never go negative");
}

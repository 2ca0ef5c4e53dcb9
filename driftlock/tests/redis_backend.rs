//! Redis backend integration tests.
//!
//! These need a live Redis with the RedisJSON module loaded; point
//! `REDIS_URL` at it and run with `cargo test -- --ignored`.

use std::time::Duration;

use driftlock::{
    AppliedRecord, Backend, FieldSpec, FieldType, IndexSpec, LockManager, MigrateError,
    RedisBackend, SchemaContract, StateStore, UnitId,
};
use chrono::Utc;
use serde_json::json;
use serial_test::serial;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn backend(prefix: &str) -> RedisBackend {
    let backend = RedisBackend::connect(&redis_url())
        .await
        .expect("redis connection")
        .with_prefix(prefix);
    // Start from a clean slate for this prefix.
    backend.drop_collection("users").await.expect("cleanup");
    backend
}

fn users_contract() -> SchemaContract {
    SchemaContract {
        required: vec![
            FieldSpec::new("_id", FieldType::Identifier),
            FieldSpec::new("email", FieldType::String),
            FieldSpec::new("name", FieldType::String),
            FieldSpec::new("created_at", FieldType::Date),
        ],
        optional: vec![],
        unique_key: "_id".to_string(),
        indexes: vec![
            IndexSpec::new("email").unique(),
            IndexSpec::new("name").sparse(),
        ],
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis with RedisJSON"]
async fn collection_lifecycle_and_unique_enforcement() {
    let backend = backend("driftlock_test_docs").await;

    backend.create_collection("users", &users_contract()).await.unwrap();
    let err = backend.create_collection("users", &users_contract()).await.unwrap_err();
    assert!(matches!(err, MigrateError::AlreadyExists { .. }));

    backend
        .insert(
            "users",
            json!({
                "email": "a@example.com",
                "name": "Alice",
                "created_at": "2025-11-08T17:30:01Z",
            }),
        )
        .await
        .unwrap();
    let err = backend
        .insert(
            "users",
            json!({
                "email": "a@example.com",
                "name": "Bob",
                "created_at": "2025-11-08T17:31:00Z",
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::UniqueViolation { ref field, .. } if field == "email"));
    assert_eq!(backend.count("users").await.unwrap(), 1);

    backend.drop_collection("users").await.unwrap();
    assert!(!backend.collection_exists("users").await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis with RedisJSON"]
async fn applied_records_are_idempotent_per_id() {
    let backend = backend("driftlock_test_state").await;
    let id = UnitId::parse("20250101000000-a").unwrap();

    // Clear any record left by a previous run.
    let _ = backend.record_reverted(&id).await;

    backend
        .record_applied(AppliedRecord::new(id.clone(), Utc::now()))
        .await
        .unwrap();
    let err = backend
        .record_applied(AppliedRecord::new(id.clone(), Utc::now()))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::AlreadyApplied(_)));

    backend.record_reverted(&id).await.unwrap();
    let err = backend.record_reverted(&id).await.unwrap_err();
    assert!(matches!(err, MigrateError::NotApplied(_)));
}

#[tokio::test]
#[serial]
#[ignore = "requires a running Redis with RedisJSON"]
async fn lock_lease_is_exclusive_and_renewable() {
    let backend = backend("driftlock_test_lock").await;
    let ttl = Duration::from_secs(5);

    let token = backend.acquire("runner-1", ttl).await.unwrap();
    let err = backend.acquire("runner-2", ttl).await.unwrap_err();
    assert!(matches!(err, MigrateError::LockHeld { ref holder } if holder == "runner-1"));

    backend.renew(&token, ttl).await.unwrap();
    backend.release(&token).await.unwrap();

    let token = backend.acquire("runner-2", ttl).await.unwrap();
    backend.release(&token).await.unwrap();
}

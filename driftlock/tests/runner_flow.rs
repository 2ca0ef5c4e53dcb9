//! End-to-end runner behavior against the in-memory backend: ordering,
//! idempotence, reversal, fail-stop, and lock serialization.

use std::time::{Duration, Instant};

use driftlock::{
    Action, Backend, FieldSpec, FieldType, Halt, LockLease, LockManager, MemoryBackend,
    MigrateError, MigrationUnit, Registry, Runner, SchemaContract, StateStore, UnitId, UnitState,
};

fn contract() -> SchemaContract {
    SchemaContract {
        required: vec![FieldSpec::new("_id", FieldType::Identifier)],
        optional: vec![],
        unique_key: "_id".to_string(),
        indexes: vec![],
    }
}

/// A unit that owns the full lifecycle of one collection.
fn collection_unit(id: &str, collection: &str) -> MigrationUnit {
    MigrationUnit::new(
        UnitId::parse(id).unwrap(),
        vec![Action::CreateCollection {
            name: collection.to_string(),
            schema: contract(),
        }],
        vec![Action::DropCollection {
            name: collection.to_string(),
        }],
    )
}

fn id(raw: &str) -> UnitId {
    UnitId::parse(raw).unwrap()
}

fn five_units() -> Vec<MigrationUnit> {
    vec![
        collection_unit("20250101000000-alpha", "alpha"),
        collection_unit("20250102000000-bravo", "bravo"),
        collection_unit("20250103000000-charlie", "charlie"),
        collection_unit("20250104000000-delta", "delta"),
        collection_unit("20250105000000-echo", "echo"),
    ]
}

#[tokio::test]
async fn up_to_latest_applies_all_units_in_id_order() {
    let backend = MemoryBackend::new();
    let runner = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap());

    let report = runner.up(None).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.executed.len(), 5);
    assert_eq!(report.last_applied, Some(id("20250105000000-echo")));

    let applied = backend.applied().await.unwrap();
    let ids: Vec<&str> = applied.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "20250101000000-alpha",
            "20250102000000-bravo",
            "20250103000000-charlie",
            "20250104000000-delta",
            "20250105000000-echo",
        ]
    );
    // applied_at order matches id order.
    assert!(applied.windows(2).all(|w| w[0].applied_at <= w[1].applied_at));
}

#[tokio::test]
async fn second_up_run_is_a_noop() {
    let backend = MemoryBackend::new();
    let runner = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap());

    runner.up(None).await.unwrap();
    let report = runner.up(None).await.unwrap();

    assert!(report.succeeded());
    assert!(report.executed.is_empty());
    assert_eq!(backend.applied().await.unwrap().len(), 5);
}

#[tokio::test]
async fn up_to_explicit_target_stops_at_target() {
    let backend = MemoryBackend::new();
    let runner = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap());

    let target = id("20250103000000-charlie");
    let report = runner.up(Some(&target)).await.unwrap();

    assert_eq!(report.executed.len(), 3);
    assert_eq!(report.last_applied, Some(target));
    assert!(!backend.collection_exists("delta").await.unwrap());
}

#[tokio::test]
async fn down_to_none_reverts_everything_in_descending_order() {
    let backend = MemoryBackend::new();
    let runner = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap());
    runner.up(None).await.unwrap();

    let report = runner.down(None).await.unwrap();
    assert!(report.succeeded());
    let ids: Vec<&str> = report.executed.iter().map(|r| r.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "20250105000000-echo",
            "20250104000000-delta",
            "20250103000000-charlie",
            "20250102000000-bravo",
            "20250101000000-alpha",
        ]
    );
    assert!(report.last_applied.is_none());
    assert!(backend.applied().await.unwrap().is_empty());

    // Reverting again from an empty applied set is a no-op success.
    let report = runner.down(None).await.unwrap();
    assert!(report.succeeded());
    assert!(report.executed.is_empty());
}

#[tokio::test]
async fn down_to_target_keeps_the_target_applied() {
    let backend = MemoryBackend::new();
    let runner = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap());
    runner.up(None).await.unwrap();

    let target = id("20250102000000-bravo");
    let report = runner.down(Some(&target)).await.unwrap();

    assert_eq!(report.executed.len(), 3);
    assert_eq!(report.last_applied, Some(target));
    let applied = backend.applied().await.unwrap();
    assert_eq!(applied.len(), 2);
}

#[tokio::test]
async fn failing_third_unit_stops_the_run_with_two_applied() {
    let backend = MemoryBackend::new();
    // The third unit re-creates "alpha", which the first unit owns: a
    // configuration defect that surfaces as AlreadyExists.
    let units = vec![
        collection_unit("20250101000000-alpha", "alpha"),
        collection_unit("20250102000000-bravo", "bravo"),
        collection_unit("20250103000000-clash", "alpha"),
        collection_unit("20250104000000-delta", "delta"),
        collection_unit("20250105000000-echo", "echo"),
    ];
    let runner = Runner::new(backend.clone(), Registry::from_units(units).unwrap());

    let report = runner.up(None).await.unwrap();
    assert!(!report.succeeded());
    assert_eq!(report.executed.len(), 2);
    assert_eq!(report.last_applied, Some(id("20250102000000-bravo")));
    match &report.halt {
        Some(Halt::Failed { id, error }) => {
            assert_eq!(id.as_str(), "20250103000000-clash");
            assert!(error.contains("already exists"));
        }
        other => panic!("expected Failed halt, got {other:?}"),
    }

    // Exactly two applied records; the failing and later units left pending.
    assert_eq!(backend.applied().await.unwrap().len(), 2);
    let status = runner.status().await.unwrap();
    assert_eq!(status.applied_count(), 2);
    assert_eq!(status.pending_count(), 3);
    assert_eq!(status.entries[2].state, UnitState::Pending);
    assert_eq!(status.entries[3].state, UnitState::Pending);
    assert_eq!(status.entries[4].state, UnitState::Pending);

    // The lock was released despite the failure; a retry resumes (and
    // fails again at the same unit, since the defect is still there).
    let retry = runner.up(None).await.unwrap();
    assert!(!retry.succeeded());
    assert!(retry.executed.is_empty());
}

#[tokio::test]
async fn concurrent_runners_are_serialized_by_the_lock() {
    let backend = MemoryBackend::new();
    let lease = LockLease {
        ttl: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(5),
    };
    let runner_a = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap())
        .with_lease(lease.clone());
    let runner_b = Runner::new(backend.clone(), Registry::from_units(five_units()).unwrap())
        .with_lease(lease);

    let (a, b) = tokio::join!(runner_a.up(None), runner_b.up(None));
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one run did the work; the other found nothing pending.
    assert!(a.succeeded() && b.succeeded());
    assert_eq!(a.executed.len() + b.executed.len(), 5);
    assert_eq!(backend.applied().await.unwrap().len(), 5);
}

#[tokio::test]
async fn runner_fails_fast_when_the_lock_is_held() {
    let backend = MemoryBackend::new();
    let _held = backend
        .acquire("deploy-replica-2", Duration::from_secs(60))
        .await
        .unwrap();

    let lease = LockLease {
        ttl: Duration::from_secs(5),
        acquire_timeout: Duration::from_millis(100),
        retry_interval: Duration::from_millis(10),
    };
    let runner = Runner::new(backend, Registry::from_units(five_units()).unwrap()).with_lease(lease);

    let started = Instant::now();
    let err = runner.up(None).await.unwrap_err();
    assert!(matches!(err, MigrateError::LockHeld { ref holder } if holder == "deploy-replica-2"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

//! In-memory backend. Mirrors the Redis backend's semantics exactly, with
//! everything held in process; the primary double for runner tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::Backend;
use crate::errors::MigrateError;
use crate::id::{UnitId, generate_document_id};
use crate::lock::{LockManager, LockRecord, LockToken, lease_delta};
use crate::schema::{IndexSpec, SchemaContract};
use crate::store::{AppliedRecord, StateStore};

/// Shared in-process database. Cloning yields a handle onto the same state,
/// so multiple runners in one test can race against one "database".
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, MemoryCollection>,
    applied: BTreeMap<UnitId, DateTime<Utc>>,
    lock: Option<LockRecord>,
}

#[derive(Debug)]
struct MemoryCollection {
    schema: SchemaContract,
    indexes: Vec<IndexSpec>,
    documents: BTreeMap<String, Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lock record, if any. Test observability only.
    pub fn lock_record(&self) -> Option<LockRecord> {
        self.inner.read().unwrap().lock.clone()
    }
}

/// Uniqueness key for a document under one index: the field's value, with
/// absent treated as null for non-sparse indexes.
fn index_value<'a>(document: &'a Value, field: &str) -> &'a Value {
    document.get(field).unwrap_or(&Value::Null)
}

impl Backend for MemoryBackend {
    async fn create_collection(&self, name: &str, schema: &SchemaContract) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        if state.collections.contains_key(name) {
            return Err(MigrateError::AlreadyExists {
                collection: name.to_string(),
            });
        }
        state.collections.insert(
            name.to_string(),
            MemoryCollection {
                schema: schema.clone(),
                indexes: schema.indexes.clone(),
                documents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        let entry = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| MigrateError::NotFound {
                collection: collection.to_string(),
            })?;

        match entry.indexes.iter().find(|existing| existing.field == index.field) {
            Some(existing) if existing == index => Ok(()),
            Some(_) => Err(MigrateError::IndexConflict {
                collection: collection.to_string(),
                field: index.field.clone(),
            }),
            None => {
                entry.indexes.push(index.clone());
                Ok(())
            }
        }
    }

    async fn drop_index(&self, collection: &str, field: &str) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        let entry = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| MigrateError::NotFound {
                collection: collection.to_string(),
            })?;
        entry.indexes.retain(|existing| existing.field != field);
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), MigrateError> {
        // Dropping an absent collection is a deliberate no-op.
        self.inner.write().unwrap().collections.remove(name);
        Ok(())
    }

    async fn insert(&self, collection: &str, mut document: Value) -> Result<String, MigrateError> {
        let mut state = self.inner.write().unwrap();
        let entry = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| MigrateError::NotFound {
                collection: collection.to_string(),
            })?;

        // Supply the unique key before validation, as the database engine
        // would for an auto-generated identifier.
        let unique_key = entry.schema.unique_key.clone();
        if let Some(object) = document.as_object_mut()
            && !object.contains_key(&unique_key)
        {
            object.insert(unique_key.clone(), Value::String(generate_document_id()));
        }

        entry.schema.validate_document(&document)?;

        let document_id = document
            .get(&unique_key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                MigrateError::other(format!("unique key field '{unique_key}' must be a string"))
            })?;

        if entry.documents.contains_key(&document_id) {
            return Err(MigrateError::UniqueViolation {
                collection: collection.to_string(),
                field: unique_key,
                value: document_id,
            });
        }

        for index in entry.indexes.iter().filter(|index| index.unique) {
            let candidate = index_value(&document, &index.field);
            if candidate.is_null() && index.sparse {
                continue;
            }
            let taken = entry
                .documents
                .values()
                .any(|existing| index_value(existing, &index.field) == candidate);
            if taken {
                return Err(MigrateError::UniqueViolation {
                    collection: collection.to_string(),
                    field: index.field.clone(),
                    value: candidate.to_string(),
                });
            }
        }

        entry.documents.insert(document_id.clone(), document);
        Ok(document_id)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, MigrateError> {
        Ok(self.inner.read().unwrap().collections.contains_key(name))
    }

    async fn count(&self, collection: &str) -> Result<u64, MigrateError> {
        let state = self.inner.read().unwrap();
        let entry = state
            .collections
            .get(collection)
            .ok_or_else(|| MigrateError::NotFound {
                collection: collection.to_string(),
            })?;
        Ok(entry.documents.len() as u64)
    }
}

impl StateStore for MemoryBackend {
    async fn applied(&self) -> Result<Vec<AppliedRecord>, MigrateError> {
        let state = self.inner.read().unwrap();
        Ok(state
            .applied
            .iter()
            .map(|(id, applied_at)| AppliedRecord::new(id.clone(), *applied_at))
            .collect())
    }

    async fn record_applied(&self, record: AppliedRecord) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        if state.applied.contains_key(&record.id) {
            return Err(MigrateError::AlreadyApplied(record.id));
        }
        state.applied.insert(record.id, record.applied_at);
        Ok(())
    }

    async fn record_reverted(&self, id: &UnitId) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        if state.applied.remove(id).is_none() {
            return Err(MigrateError::NotApplied(id.clone()));
        }
        Ok(())
    }
}

impl LockManager for MemoryBackend {
    async fn acquire(&self, owner: &str, ttl: Duration) -> Result<LockToken, MigrateError> {
        let mut state = self.inner.write().unwrap();
        let now = Utc::now();
        if let Some(record) = &state.lock
            && !record.is_expired(now)
        {
            return Err(MigrateError::LockHeld {
                holder: record.holder.clone(),
            });
        }
        // Either no record, or an expired one left by a crashed holder.
        state.lock = Some(LockRecord::new(owner, now, ttl));
        Ok(LockToken::new(owner))
    }

    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        let now = Utc::now();
        match &mut state.lock {
            Some(record) if record.holder == token.holder() && !record.is_expired(now) => {
                record.expires_at = now + lease_delta(ttl);
                Ok(())
            }
            Some(record) if !record.is_expired(now) => Err(MigrateError::LockHeld {
                holder: record.holder.clone(),
            }),
            _ => Err(MigrateError::LockHeld {
                holder: "<lease expired>".to_string(),
            }),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), MigrateError> {
        let mut state = self.inner.write().unwrap();
        if let Some(record) = &state.lock
            && record.holder == token.holder()
        {
            state.lock = None;
        }
        // A lease that expired and was reclaimed is not ours to delete.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use serde_json::json;

    fn contract() -> SchemaContract {
        SchemaContract {
            required: vec![
                FieldSpec::new("_id", FieldType::Identifier),
                FieldSpec::new("email", FieldType::String),
            ],
            optional: vec![FieldSpec::new("name", FieldType::String)],
            unique_key: "_id".to_string(),
            indexes: vec![IndexSpec::new("email").unique()],
        }
    }

    #[tokio::test]
    async fn create_collection_twice_fails() {
        let backend = MemoryBackend::new();
        backend.create_collection("users", &contract()).await.unwrap();
        let err = backend.create_collection("users", &contract()).await.unwrap_err();
        assert!(matches!(err, MigrateError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn drop_absent_collection_is_a_noop() {
        let backend = MemoryBackend::new();
        backend.drop_collection("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn identical_index_redeclaration_is_a_noop() {
        let backend = MemoryBackend::new();
        backend.create_collection("users", &contract()).await.unwrap();
        backend
            .create_index("users", &IndexSpec::new("email").unique())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn incompatible_index_conflicts() {
        let backend = MemoryBackend::new();
        backend.create_collection("users", &contract()).await.unwrap();
        let err = backend
            .create_index("users", &IndexSpec::new("email"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::IndexConflict { .. }));
    }

    #[tokio::test]
    async fn insert_generates_missing_unique_key() {
        let backend = MemoryBackend::new();
        backend.create_collection("users", &contract()).await.unwrap();
        let id = backend
            .insert("users", json!({"email": "a@example.com"}))
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(backend.count("users").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_unique_index_value_is_rejected() {
        let backend = MemoryBackend::new();
        backend.create_collection("users", &contract()).await.unwrap();
        backend
            .insert("users", json!({"_id": "u1", "email": "a@example.com"}))
            .await
            .unwrap();
        let err = backend
            .insert("users", json!({"_id": "u2", "email": "a@example.com"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::UniqueViolation { ref field, .. } if field == "email"));
    }

    #[tokio::test]
    async fn sparse_unique_index_skips_absent_values() {
        let backend = MemoryBackend::new();
        let mut schema = contract();
        schema.indexes.push(IndexSpec::new("name").unique().sparse());
        backend.create_collection("users", &schema).await.unwrap();
        backend
            .insert("users", json!({"_id": "u1", "email": "a@example.com"}))
            .await
            .unwrap();
        // Second document also has no name; sparse index must not collide.
        backend
            .insert("users", json!({"_id": "u2", "email": "b@example.com"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn applied_records_guard_double_application() {
        let backend = MemoryBackend::new();
        let id = UnitId::parse("20250101000000-a").unwrap();
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
    async fn lock_is_exclusive_until_released() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(30);
        let token = backend.acquire("runner-1", ttl).await.unwrap();

        let err = backend.acquire("runner-2", ttl).await.unwrap_err();
        assert!(matches!(err, MigrateError::LockHeld { ref holder } if holder == "runner-1"));

        backend.release(&token).await.unwrap();
        backend.acquire("runner-2", ttl).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let backend = MemoryBackend::new();
        backend.acquire("crashed", Duration::from_millis(0)).await.unwrap();
        // ttl of zero expires immediately; a new holder may reclaim.
        backend.acquire("runner-2", Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn renew_extends_a_held_lease() {
        let backend = MemoryBackend::new();
        let token = backend.acquire("runner-1", Duration::from_secs(1)).await.unwrap();
        let before = backend.lock_record().unwrap().expires_at;
        backend.renew(&token, Duration::from_secs(60)).await.unwrap();
        let after = backend.lock_record().unwrap().expires_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn renew_fails_after_lease_was_reclaimed() {
        let backend = MemoryBackend::new();
        let stale = backend.acquire("crashed", Duration::from_millis(0)).await.unwrap();
        backend.acquire("runner-2", Duration::from_secs(30)).await.unwrap();
        let err = backend.renew(&stale, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, MigrateError::LockHeld { .. }));
    }
}

//! Redis-backed document store using RedisJSON.
//!
//! Documents live at `{prefix}:{collection}:{id}`, the schema contract at
//! `{prefix}:schema:{collection}`, index specs in a hash at
//! `{prefix}:indexes:{collection}`, and unique-index claims in hashes at
//! `{prefix}:{collection}:unique:{field}`. Applied records and the lock
//! record share the same prefix, so runner state is colocated with the
//! documents it governs.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value;

use crate::backend::Backend;
use crate::errors::MigrateError;
use crate::id::{UnitId, generate_document_id};
use crate::keys::{DEFAULT_PREFIX, KeyContext};
use crate::lock::{LockManager, LockRecord, LockToken, lease_delta};
use crate::schema::{IndexSpec, SchemaContract};
use crate::store::{AppliedRecord, StateStore};

pub const LOCK_RENEW_SCRIPT_BODY: &str = include_str!("../../lua/lock_renew.lua");
pub const LOCK_RELEASE_SCRIPT_BODY: &str = include_str!("../../lua/lock_release.lua");

static LOCK_RENEW_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(LOCK_RENEW_SCRIPT_BODY));
static LOCK_RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(LOCK_RELEASE_SCRIPT_BODY));

const SCAN_COUNT: usize = 1024;

#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect to Redis and return a backend using the default key prefix.
    pub async fn connect(redis_url: &str) -> Result<Self, MigrateError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Wrap an existing connection manager (shared with application code).
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn keys(&self) -> KeyContext<'_> {
        KeyContext::new(&self.prefix)
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Fetch and unwrap a RedisJSON value stored at the root path.
    async fn json_get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MigrateError> {
        let mut conn = self.conn();
        let raw: Option<String> = redis::cmd("JSON.GET")
            .arg(key)
            .arg("$")
            .query_async(&mut conn)
            .await?;
        match raw {
            // JSON.GET with a path returns an array of matches.
            Some(json) => {
                let mut wrapper: Vec<T> = serde_json::from_str(&json).map_err(|err| {
                    MigrateError::other(format!("failed to deserialize value at '{key}': {err}"))
                })?;
                Ok(if wrapper.is_empty() {
                    None
                } else {
                    Some(wrapper.remove(0))
                })
            }
            None => Ok(None),
        }
    }

    async fn load_schema(&self, collection: &str) -> Result<SchemaContract, MigrateError> {
        self.json_get(&self.keys().schema(collection))
            .await?
            .ok_or_else(|| MigrateError::NotFound {
                collection: collection.to_string(),
            })
    }

    async fn load_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, MigrateError> {
        let mut conn = self.conn();
        let entries: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(self.keys().indexes(collection))
            .query_async(&mut conn)
            .await?;
        let mut indexes = Vec::with_capacity(entries.len());
        for (field, json) in entries {
            let index: IndexSpec = serde_json::from_str(&json).map_err(|err| {
                MigrateError::other(format!("corrupt index spec for '{collection}.{field}': {err}"))
            })?;
            indexes.push(index);
        }
        Ok(indexes)
    }

    async fn store_index(&self, collection: &str, index: &IndexSpec) -> Result<(), MigrateError> {
        let json = serde_json::to_string(index)
            .map_err(|err| MigrateError::other(format!("failed to serialize index spec: {err}")))?;
        let mut conn = self.conn();
        let _: () = redis::cmd("HSET")
            .arg(self.keys().indexes(collection))
            .arg(&index.field)
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete all keys matching a pattern via SCAN, without blocking Redis.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, MigrateError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut total_deleted: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                total_deleted += deleted;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }

    /// Undo unique-index claims taken earlier in a failed insert.
    async fn rollback_claims(&self, collection: &str, claims: &[(String, String)]) {
        let mut conn = self.conn();
        for (field, encoded) in claims {
            let _: Result<(), _> = redis::cmd("HDEL")
                .arg(self.keys().unique_index(collection, field))
                .arg(encoded)
                .query_async(&mut conn)
                .await;
        }
    }

    async fn current_lock_holder(&self) -> String {
        let raw: Option<String> = {
            let mut conn = self.conn();
            redis::cmd("GET")
                .arg(self.keys().lock())
                .query_async(&mut conn)
                .await
                .unwrap_or(None)
        };
        raw.and_then(|json| serde_json::from_str::<LockRecord>(&json).ok())
            .map(|record| record.holder)
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

/// Canonical uniqueness encoding of a field value. Absent fields become
/// JSON null so non-sparse unique indexes still collide on them.
fn encode_index_value(document: &Value, field: &str) -> String {
    document.get(field).unwrap_or(&Value::Null).to_string()
}

impl Backend for RedisBackend {
    async fn create_collection(&self, name: &str, schema: &SchemaContract) -> Result<(), MigrateError> {
        let json = serde_json::to_string(schema)
            .map_err(|err| MigrateError::other(format!("failed to serialize schema: {err}")))?;
        let mut conn = self.conn();
        let created: Option<String> = redis::cmd("JSON.SET")
            .arg(self.keys().schema(name))
            .arg("$")
            .arg(&json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Err(MigrateError::AlreadyExists {
                collection: name.to_string(),
            });
        }
        for index in &schema.indexes {
            self.store_index(name, index).await?;
        }
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), MigrateError> {
        if !self.collection_exists(collection).await? {
            return Err(MigrateError::NotFound {
                collection: collection.to_string(),
            });
        }
        let mut conn = self.conn();
        let existing: Option<String> = redis::cmd("HGET")
            .arg(self.keys().indexes(collection))
            .arg(&index.field)
            .query_async(&mut conn)
            .await?;
        match existing {
            Some(json) => {
                let current: IndexSpec = serde_json::from_str(&json).map_err(|err| {
                    MigrateError::other(format!(
                        "corrupt index spec for '{collection}.{}': {err}",
                        index.field
                    ))
                })?;
                if &current == index {
                    Ok(())
                } else {
                    Err(MigrateError::IndexConflict {
                        collection: collection.to_string(),
                        field: index.field.clone(),
                    })
                }
            }
            None => self.store_index(collection, index).await,
        }
    }

    async fn drop_index(&self, collection: &str, field: &str) -> Result<(), MigrateError> {
        if !self.collection_exists(collection).await? {
            return Err(MigrateError::NotFound {
                collection: collection.to_string(),
            });
        }
        let mut conn = self.conn();
        let _: u64 = redis::cmd("HDEL")
            .arg(self.keys().indexes(collection))
            .arg(field)
            .query_async(&mut conn)
            .await?;
        let _: u64 = redis::cmd("DEL")
            .arg(self.keys().unique_index(collection, field))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), MigrateError> {
        let keys = self.keys();
        let mut conn = self.conn();
        // Dropping an absent collection is a deliberate no-op; DEL on
        // missing keys already behaves that way.
        let _: u64 = redis::cmd("DEL")
            .arg(keys.schema(name))
            .arg(keys.indexes(name))
            .query_async(&mut conn)
            .await?;
        self.delete_pattern(&keys.collection_pattern(name)).await?;
        Ok(())
    }

    async fn insert(&self, collection: &str, mut document: Value) -> Result<String, MigrateError> {
        let schema = self.load_schema(collection).await?;

        // Supply the unique key before validation, as the database engine
        // would for an auto-generated identifier.
        let unique_key = schema.unique_key.clone();
        if let Some(object) = document.as_object_mut()
            && !object.contains_key(&unique_key)
        {
            object.insert(unique_key.clone(), Value::String(generate_document_id()));
        }

        schema.validate_document(&document)?;

        let document_id = document
            .get(&unique_key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                MigrateError::other(format!("unique key field '{unique_key}' must be a string"))
            })?;

        // Claim unique-index slots first; roll them back if any claim or
        // the document write itself loses.
        let indexes = self.load_indexes(collection).await?;
        let mut claims: Vec<(String, String)> = Vec::new();
        for index in indexes.iter().filter(|index| index.unique) {
            let raw = document.get(&index.field);
            if index.sparse && raw.is_none_or(Value::is_null) {
                continue;
            }
            let encoded = encode_index_value(&document, &index.field);
            let mut conn = self.conn();
            let claimed: u64 = redis::cmd("HSETNX")
                .arg(self.keys().unique_index(collection, &index.field))
                .arg(&encoded)
                .arg(&document_id)
                .query_async(&mut conn)
                .await?;
            if claimed == 0 {
                self.rollback_claims(collection, &claims).await;
                return Err(MigrateError::UniqueViolation {
                    collection: collection.to_string(),
                    field: index.field.clone(),
                    value: encoded,
                });
            }
            claims.push((index.field.clone(), encoded));
        }

        let json = serde_json::to_string(&document)
            .map_err(|err| MigrateError::other(format!("failed to serialize document: {err}")))?;
        let mut conn = self.conn();
        let written: Option<String> = redis::cmd("JSON.SET")
            .arg(self.keys().document(collection, &document_id))
            .arg("$")
            .arg(&json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if written.is_none() {
            self.rollback_claims(collection, &claims).await;
            return Err(MigrateError::UniqueViolation {
                collection: collection.to_string(),
                field: unique_key,
                value: document_id,
            });
        }

        Ok(document_id)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, MigrateError> {
        let mut conn = self.conn();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys().schema(name))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn count(&self, collection: &str) -> Result<u64, MigrateError> {
        if !self.collection_exists(collection).await? {
            return Err(MigrateError::NotFound {
                collection: collection.to_string(),
            });
        }
        let keys = self.keys();
        let pattern = keys.collection_pattern(collection);
        // The pattern also matches unique-index keys; filter those out.
        let unique_prefix = keys.unique_prefix(collection);
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut total: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            total += batch.iter().filter(|key| !key.starts_with(&unique_prefix)).count() as u64;
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(total)
    }
}

impl StateStore for RedisBackend {
    async fn applied(&self) -> Result<Vec<AppliedRecord>, MigrateError> {
        let mut conn = self.conn();
        let entries: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(self.keys().applied())
            .query_async(&mut conn)
            .await?;
        let mut records = Vec::with_capacity(entries.len());
        for (id, json) in entries {
            let record: AppliedRecord = serde_json::from_str(&json).map_err(|err| {
                MigrateError::other(format!("corrupt applied record for '{id}': {err}"))
            })?;
            records.push(record);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn record_applied(&self, record: AppliedRecord) -> Result<(), MigrateError> {
        let json = serde_json::to_string(&record)
            .map_err(|err| MigrateError::other(format!("failed to serialize applied record: {err}")))?;
        let mut conn = self.conn();
        let inserted: u64 = redis::cmd("HSETNX")
            .arg(self.keys().applied())
            .arg(record.id.as_str())
            .arg(&json)
            .query_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(MigrateError::AlreadyApplied(record.id));
        }
        Ok(())
    }

    async fn record_reverted(&self, id: &UnitId) -> Result<(), MigrateError> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("HDEL")
            .arg(self.keys().applied())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(MigrateError::NotApplied(id.clone()));
        }
        Ok(())
    }
}

impl LockManager for RedisBackend {
    async fn acquire(&self, owner: &str, ttl: Duration) -> Result<LockToken, MigrateError> {
        let record = LockRecord::new(owner, Utc::now(), ttl);
        let json = serde_json::to_string(&record)
            .map_err(|err| MigrateError::other(format!("failed to serialize lock record: {err}")))?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn();
        let taken: Option<String> = redis::cmd("SET")
            .arg(self.keys().lock())
            .arg(&json)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        if taken.is_none() {
            return Err(MigrateError::LockHeld {
                holder: self.current_lock_holder().await,
            });
        }
        Ok(LockToken::new(owner))
    }

    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), MigrateError> {
        let expires_at = (Utc::now() + lease_delta(ttl)).to_rfc3339();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn();
        let renewed: u64 = LOCK_RENEW_SCRIPT
            .key(self.keys().lock())
            .arg(token.holder())
            .arg(&expires_at)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        if renewed == 0 {
            return Err(MigrateError::LockHeld {
                holder: self.current_lock_holder().await,
            });
        }
        Ok(())
    }

    async fn release(&self, token: &LockToken) -> Result<(), MigrateError> {
        let mut conn = self.conn();
        // A lease that expired and was reclaimed is not ours to delete; the
        // script returns 0 in that case and we treat it as released.
        let _: u64 = LOCK_RELEASE_SCRIPT
            .key(self.keys().lock())
            .arg(token.holder())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

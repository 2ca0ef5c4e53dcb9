//! Database capability surface consumed by migration units.

use serde_json::Value;

use crate::errors::MigrateError;
use crate::schema::{IndexSpec, SchemaContract};
use crate::unit::Action;

mod memory;
mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Structural operations a document database must offer for units to run
/// against it. Backends also implement [`crate::store::StateStore`] and
/// [`crate::lock::LockManager`] so runner state lives colocated with the
/// documents it describes.
#[allow(async_fn_in_trait)]
pub trait Backend {
    /// Create a collection and install its schema contract. Fails with
    /// `AlreadyExists` if the collection is present.
    async fn create_collection(&self, name: &str, schema: &SchemaContract) -> Result<(), MigrateError>;

    /// Create a secondary index. An identical existing index is a no-op;
    /// an existing index on the same field with different uniqueness or
    /// sparseness fails with `IndexConflict`.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), MigrateError>;

    /// Drop a secondary index. Dropping an absent index is a no-op.
    async fn drop_index(&self, collection: &str, field: &str) -> Result<(), MigrateError>;

    /// Drop a collection with its documents, indexes, and schema contract.
    /// Dropping an absent collection is a no-op.
    async fn drop_collection(&self, name: &str) -> Result<(), MigrateError>;

    /// Insert a document, enforcing the schema contract and all unique
    /// indexes. Returns the document id (taken from the contract's unique
    /// key field when present, generated otherwise).
    async fn insert(&self, collection: &str, document: Value) -> Result<String, MigrateError>;

    async fn collection_exists(&self, name: &str) -> Result<bool, MigrateError>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<u64, MigrateError>;
}

/// Execute one declarative action against a backend.
pub async fn execute_action<B: Backend>(backend: &B, action: &Action) -> Result<(), MigrateError> {
    match action {
        Action::CreateCollection { name, schema } => backend.create_collection(name, schema).await,
        Action::CreateIndex { collection, index } => backend.create_index(collection, index).await,
        Action::DropIndex { collection, field } => backend.drop_index(collection, field).await,
        Action::DropCollection { name } => backend.drop_collection(name).await,
    }
}

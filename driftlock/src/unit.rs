use serde::{Deserialize, Serialize};

use crate::id::UnitId;
use crate::schema::{IndexSpec, SchemaContract};

/// One structural mutation against the target database.
///
/// Units are data-described: an ordered list of actions per direction
/// instead of loaded scripts, so no dynamic loading is involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    /// Create a collection and install its schema contract. Fails if the
    /// collection already exists.
    CreateCollection { name: String, schema: SchemaContract },
    /// Create a secondary index. Fails on an incompatible existing index;
    /// re-declaring an identical index is a no-op.
    CreateIndex { collection: String, index: IndexSpec },
    /// Drop a secondary index. No-op if the index is absent.
    DropIndex { collection: String, field: String },
    /// Drop a collection with all its documents and indexes. No-op if the
    /// collection is absent.
    DropCollection { name: String },
}

/// A versioned migration unit: an ordered identifier plus the forward and
/// backward action lists. Immutable once authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationUnit {
    pub id: UnitId,
    pub up: Vec<Action>,
    pub down: Vec<Action>,
}

impl MigrationUnit {
    pub fn new(id: UnitId, up: Vec<Action>, down: Vec<Action>) -> Self {
        Self { id, up, down }
    }
}

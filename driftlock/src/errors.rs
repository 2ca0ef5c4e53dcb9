use std::borrow::Cow;

use thiserror::Error;

use crate::id::UnitId;

/// Top-level error type returned by the driftlock runner and backends.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Another runner holds the migration lock. Recoverable: retry later.
    #[error("migration lock held by '{holder}'")]
    LockHeld { holder: String },

    /// Two registered units share the same identifier.
    #[error("duplicate unit id '{0}'")]
    DuplicateId(UnitId),

    /// The applied-state store already has a record for this unit.
    #[error("unit '{0}' is already recorded as applied")]
    AlreadyApplied(UnitId),

    /// The applied-state store has no record for this unit.
    #[error("unit '{0}' is not recorded as applied")]
    NotApplied(UnitId),

    /// A target collection already exists.
    #[error("collection '{collection}' already exists")]
    AlreadyExists { collection: String },

    /// An incompatible index already exists on the field.
    #[error("incompatible index on '{collection}.{field}'")]
    IndexConflict { collection: String, field: String },

    /// The target collection does not exist.
    #[error("collection '{collection}' not found")]
    NotFound { collection: String },

    /// A document failed schema-contract validation.
    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    /// A document violates a unique index.
    #[error("unique index violation on '{collection}.{field}' for value {value}")]
    UniqueViolation {
        collection: String,
        field: String,
        value: String,
    },

    /// A unit's body failed mid-run. Carries the failing id so operators
    /// know the exact resume point.
    #[error("unit '{id}' failed: {source}")]
    UnitExecution {
        id: UnitId,
        #[source]
        source: Box<MigrateError>,
    },

    /// The requested target id is not present in the registry.
    #[error("unknown target unit '{0}'")]
    UnknownTarget(UnitId),

    /// A unit identifier failed to parse.
    #[error("invalid unit id '{input}': {reason}")]
    InvalidId { input: String, reason: &'static str },

    /// Underlying Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{message}")]
    Other { message: Cow<'static, str> },
}

impl MigrateError {
    pub fn other(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Wrap a unit-body failure with the failing unit's id.
    pub fn in_unit(self, id: UnitId) -> Self {
        Self::UnitExecution {
            id,
            source: Box::new(self),
        }
    }
}

/// Collection of schema-contract violations for a single document.
#[derive(Debug, Error)]
#[error("schema validation failed: {issues:?}")]
pub struct SchemaViolation {
    pub issues: Vec<SchemaIssue>,
}

impl SchemaViolation {
    pub fn new<I>(issues: I) -> Self
    where
        I: IntoIterator<Item = SchemaIssue>,
    {
        Self {
            issues: issues.into_iter().collect(),
        }
    }

    /// Convenience helper for a single-field violation.
    pub fn single(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new([SchemaIssue::new(field, code, message)])
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A single violated constraint on one field.
#[derive(Debug, Clone)]
pub struct SchemaIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

//! driftlock core library.
//!
//! A migration execution core for JSON document stores: versioned,
//! data-described migration units applied exactly once, in order, under a
//! leased exclusive lock, with durable applied-state tracking and support
//! for reversal.

pub mod backend;
pub mod errors;
pub mod id;
pub mod keys;
pub mod lock;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod store;
pub mod unit;

pub use backend::{Backend, MemoryBackend, RedisBackend, execute_action};
pub use errors::{MigrateError, SchemaIssue, SchemaViolation};
pub use id::UnitId;
pub use lock::{LockLease, LockManager, LockRecord, LockToken};
pub use registry::Registry;
pub use runner::{Direction, Halt, RunReport, Runner, StatusEntry, StatusReport, UnitState};
pub use schema::{FieldSpec, FieldType, IndexSpec, SchemaContract};
pub use store::{AppliedRecord, StateStore};
pub use unit::{Action, MigrationUnit};

// Re-export redis types so users don't need to depend on a specific redis version
pub use redis;
pub use redis::aio::ConnectionManager;

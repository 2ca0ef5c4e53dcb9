use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MigrateError;
use crate::id::UnitId;

/// One record per successfully applied unit. Absence of a record means the
/// unit is not applied (or has been reverted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub id: UnitId,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    pub fn new(id: UnitId, applied_at: DateTime<Utc>) -> Self {
        Self { id, applied_at }
    }
}

/// Durable record of which units have been applied against a database.
///
/// Implementations must colocate the records with the target database so a
/// crash between unit execution and record write stays observable as
/// "executed but not recorded". That gap is a documented property of the
/// runner, not something the store can close.
#[allow(async_fn_in_trait)]
pub trait StateStore {
    /// All applied records, sorted by unit id ascending.
    async fn applied(&self) -> Result<Vec<AppliedRecord>, MigrateError>;

    /// Insert a record for a newly applied unit. Fails with
    /// `AlreadyApplied` if a record for the id exists; this guards against
    /// double application.
    async fn record_applied(&self, record: AppliedRecord) -> Result<(), MigrateError>;

    /// Delete the record for a reverted unit. Fails with `NotApplied` if no
    /// record exists.
    async fn record_reverted(&self, id: &UnitId) -> Result<(), MigrateError>;
}

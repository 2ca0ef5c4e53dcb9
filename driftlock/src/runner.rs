//! Orchestration core: brings a database to a target version, forward or
//! backward, under the migration lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;

use crate::backend::{Backend, execute_action};
use crate::errors::MigrateError;
use crate::id::{UnitId, generate_holder};
use crate::lock::{LockLease, LockManager, LockToken};
use crate::registry::Registry;
use crate::store::{AppliedRecord, StateStore};
use crate::unit::MigrationUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Why a run stopped before reaching its target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Halt {
    /// A unit's body failed. Prior units stay applied; nothing is rolled
    /// back automatically.
    Failed { id: UnitId, error: String },
    /// The caller's cancellation flag was observed at a unit boundary.
    Cancelled { next: UnitId },
}

/// Outcome of one `up` or `down` run. The last successfully applied id and
/// the failing id are reported distinctly so operators know the exact
/// resume point.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    /// Units executed (and recorded) by this run, in execution order.
    pub executed: Vec<UnitId>,
    /// Highest-ordered unit applied after the run, if any.
    pub last_applied: Option<UnitId>,
    pub halt: Option<Halt>,
}

impl RunReport {
    fn new(direction: Direction, last_applied: Option<UnitId>) -> Self {
        Self {
            direction,
            executed: Vec::new(),
            last_applied,
            halt: None,
        }
    }

    /// True when the run reached its target without failing or being
    /// cancelled. A run with nothing to do succeeds.
    pub fn succeeded(&self) -> bool {
        self.halt.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "applied_at")]
pub enum UnitState {
    Applied(DateTime<Utc>),
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub id: UnitId,
    #[serde(flatten)]
    pub state: UnitState,
}

/// Per-unit applied/pending view of the database, plus any applied records
/// whose unit is unknown to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    pub orphaned: Vec<AppliedRecord>,
}

impl StatusReport {
    pub fn applied_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.state, UnitState::Applied(_)))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len() - self.applied_count()
    }
}

/// The migration runner.
///
/// Executes units strictly sequentially within one lock-held session;
/// multiple runner processes are serialized by the lock manager. All but
/// one fail fast with `LockHeld` once the acquisition timeout lapses.
pub struct Runner<B> {
    backend: B,
    registry: Registry,
    lease: LockLease,
    owner: String,
    cancel: Option<Arc<AtomicBool>>,
}

impl<B> Runner<B>
where
    B: Backend + StateStore + LockManager,
{
    pub fn new(backend: B, registry: Registry) -> Self {
        Self {
            backend,
            registry,
            lease: LockLease::default(),
            owner: generate_holder("driftlock"),
            cancel: None,
        }
    }

    pub fn with_lease(mut self, lease: LockLease) -> Self {
        self.lease = lease;
        self
    }

    /// Install a cancellation flag. An in-flight unit cannot be safely
    /// interrupted; a raised flag takes effect at the next unit boundary.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply pending units in ascending id order, up to `target` (inclusive)
    /// or to the latest registered unit when `target` is `None`.
    pub async fn up(&self, target: Option<&UnitId>) -> Result<RunReport, MigrateError> {
        self.check_target(target)?;
        let token = self.acquire_with_timeout().await?;
        let outcome = self.run_up(&token, target).await;
        self.finish(token, outcome).await
    }

    /// Revert applied units with id greater than `target`, in descending id
    /// order. `None` reverts everything.
    pub async fn down(&self, target: Option<&UnitId>) -> Result<RunReport, MigrateError> {
        self.check_target(target)?;
        let token = self.acquire_with_timeout().await?;
        let outcome = self.run_down(&token, target).await;
        self.finish(token, outcome).await
    }

    /// Read-only applied/pending view. Does not take the lock.
    pub async fn status(&self) -> Result<StatusReport, MigrateError> {
        let applied = self.backend.applied().await?;
        let mut by_id: BTreeMap<UnitId, DateTime<Utc>> = applied
            .into_iter()
            .map(|record| (record.id, record.applied_at))
            .collect();

        let entries = self
            .registry
            .list()
            .iter()
            .map(|unit| StatusEntry {
                id: unit.id.clone(),
                state: match by_id.remove(&unit.id) {
                    Some(applied_at) => UnitState::Applied(applied_at),
                    None => UnitState::Pending,
                },
            })
            .collect();

        let orphaned = by_id
            .into_iter()
            .map(|(id, applied_at)| AppliedRecord::new(id, applied_at))
            .collect();

        Ok(StatusReport { entries, orphaned })
    }

    fn check_target(&self, target: Option<&UnitId>) -> Result<(), MigrateError> {
        match target {
            Some(id) if !self.registry.contains(id) => Err(MigrateError::UnknownTarget(id.clone())),
            _ => Ok(()),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    async fn acquire_with_timeout(&self) -> Result<LockToken, MigrateError> {
        let deadline = Instant::now() + self.lease.acquire_timeout;
        loop {
            match self.backend.acquire(&self.owner, self.lease.ttl).await {
                Ok(token) => {
                    log::debug!("acquired migration lock as '{}'", self.owner);
                    return Ok(token);
                }
                Err(MigrateError::LockHeld { holder }) => {
                    if Instant::now() + self.lease.retry_interval >= deadline {
                        return Err(MigrateError::LockHeld { holder });
                    }
                    sleep(self.lease.retry_interval).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Release the lock unconditionally, then surface the run outcome. Lock
    /// and store errors are never swallowed; a release failure after a run
    /// failure is logged, with the run failure taking precedence.
    async fn finish(
        &self,
        token: LockToken,
        outcome: Result<RunReport, MigrateError>,
    ) -> Result<RunReport, MigrateError> {
        let released = self.backend.release(&token).await;
        log::debug!("released migration lock");
        match (outcome, released) {
            (Err(run_err), Err(release_err)) => {
                log::error!("failed to release migration lock: {release_err}");
                Err(run_err)
            }
            (Err(run_err), Ok(())) => Err(run_err),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Ok(report), Ok(())) => Ok(report),
        }
    }

    async fn run_up(
        &self,
        token: &LockToken,
        target: Option<&UnitId>,
    ) -> Result<RunReport, MigrateError> {
        let applied = self.backend.applied().await?;
        let high_water = applied.last().map(|record| record.id.clone());
        let mut report = RunReport::new(Direction::Up, high_water.clone());

        let pending: Vec<&MigrationUnit> = self
            .registry
            .list()
            .iter()
            .filter(|unit| high_water.as_ref().is_none_or(|high| unit.id > *high))
            .filter(|unit| target.is_none_or(|t| unit.id <= *t))
            .collect();

        if pending.is_empty() {
            log::info!("no pending units; database is up to date");
            return Ok(report);
        }

        for unit in pending {
            if self.cancelled() {
                log::info!("cancellation observed before unit '{}'", unit.id);
                report.halt = Some(Halt::Cancelled {
                    next: unit.id.clone(),
                });
                break;
            }

            self.backend.renew(token, self.lease.ttl).await?;

            let started = Instant::now();
            match self.execute_unit(unit, Direction::Up).await {
                Ok(()) => {
                    let record = AppliedRecord::new(unit.id.clone(), Utc::now());
                    self.backend.record_applied(record).await?;
                    log::info!(
                        "applied unit '{}' in {}ms",
                        unit.id,
                        started.elapsed().as_millis()
                    );
                    report.executed.push(unit.id.clone());
                    report.last_applied = Some(unit.id.clone());
                }
                Err(err) => {
                    // Fail-stop: partial progress is terminal and user
                    // visible, not auto-rolled back.
                    let err = err.in_unit(unit.id.clone());
                    log::warn!("{err}");
                    report.halt = Some(Halt::Failed {
                        id: unit.id.clone(),
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn run_down(
        &self,
        token: &LockToken,
        target: Option<&UnitId>,
    ) -> Result<RunReport, MigrateError> {
        let applied = self.backend.applied().await?;
        let applied_ids: Vec<UnitId> = applied.iter().map(|record| record.id.clone()).collect();
        let mut report = RunReport::new(Direction::Down, applied_ids.last().cloned());

        let to_revert: Vec<AppliedRecord> = applied
            .into_iter()
            .rev()
            .filter(|record| target.is_none_or(|t| record.id > *t))
            .collect();

        if to_revert.is_empty() {
            log::info!("no applied units above target; nothing to revert");
            return Ok(report);
        }

        for record in to_revert {
            if self.cancelled() {
                log::info!("cancellation observed before unit '{}'", record.id);
                report.halt = Some(Halt::Cancelled {
                    next: record.id.clone(),
                });
                break;
            }

            self.backend.renew(token, self.lease.ttl).await?;

            let unit = self.registry.get(&record.id).ok_or_else(|| {
                MigrateError::other(format!(
                    "applied unit '{}' is not present in the registry",
                    record.id
                ))
            })?;

            let started = Instant::now();
            match self.execute_unit(unit, Direction::Down).await {
                Ok(()) => {
                    self.backend.record_reverted(&record.id).await?;
                    log::info!(
                        "reverted unit '{}' in {}ms",
                        record.id,
                        started.elapsed().as_millis()
                    );
                    report.executed.push(record.id.clone());
                }
                Err(err) => {
                    let err = err.in_unit(record.id.clone());
                    log::warn!("{err}");
                    report.halt = Some(Halt::Failed {
                        id: record.id.clone(),
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }

        // After reverting a suffix, the remaining applied set is the prefix
        // below it.
        let remaining = applied_ids.len() - report.executed.len();
        report.last_applied = applied_ids[..remaining].last().cloned();

        Ok(report)
    }

    async fn execute_unit(&self, unit: &MigrationUnit, direction: Direction) -> Result<(), MigrateError> {
        let actions = match direction {
            Direction::Up => &unit.up,
            Direction::Down => &unit.down,
        };
        for action in actions {
            execute_action(&self.backend, action).await?;
        }
        Ok(())
    }
}

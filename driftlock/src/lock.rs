use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MigrateError;

/// The persisted lock lease. At most one non-expired record exists per
/// database at any instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(holder: impl Into<String>, acquired_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder: holder.into(),
            acquired_at,
            expires_at: acquired_at + lease_delta(ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Convert a std ttl into a chrono delta, saturating on overflow.
pub(crate) fn lease_delta(ttl: Duration) -> TimeDelta {
    TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX)
}

/// Proof of lock ownership handed back by `acquire`; required for renewal
/// and release.
#[derive(Debug, Clone)]
pub struct LockToken {
    holder: String,
}

impl LockToken {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Lease configuration for a migration run.
#[derive(Debug, Clone)]
pub struct LockLease {
    /// How long an acquired lease stays valid without renewal. A crashed
    /// holder is recoverable after this long.
    pub ttl: Duration,
    /// Upper bound on how long `acquire` keeps retrying before giving up
    /// with `LockHeld`.
    pub acquire_timeout: Duration,
    /// Delay between acquisition retries.
    pub retry_interval: Duration,
}

impl Default for LockLease {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(250),
        }
    }
}

/// Leased exclusive-execution lock over a database's migrations.
///
/// `acquire` must be atomic: when callers race, exactly one observes
/// success. Leases expire after their ttl so a crashed holder never wedges
/// the database; a live holder renews before expiry while work is ongoing.
#[allow(async_fn_in_trait)]
pub trait LockManager {
    /// Take the lock for `owner`, or fail with `LockHeld` naming the
    /// current holder. An expired record is reclaimable.
    async fn acquire(&self, owner: &str, ttl: Duration) -> Result<LockToken, MigrateError>;

    /// Extend a held lease by `ttl` from now. Fails with `LockHeld` if the
    /// lease expired and was taken by someone else, or no longer exists.
    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), MigrateError>;

    /// Release a held lease. Releasing a lease that already expired or was
    /// reclaimed is a no-op, not an error.
    async fn release(&self, token: &LockToken) -> Result<(), MigrateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_expiry_follows_ttl() {
        let now = Utc::now();
        let record = LockRecord::new("runner-1", now, Duration::from_secs(30));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + TimeDelta::seconds(31)));
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = LockRecord::new("runner-1", Utc::now(), Duration::from_secs(5));
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: LockRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(record, decoded);
    }
}

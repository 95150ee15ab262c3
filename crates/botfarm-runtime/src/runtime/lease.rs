//! Lease manager: acquire/release transitions keyed by resource id.

use chrono::{DateTime, Duration, Utc};

use crate::clock::{SharedClock, SystemClock};
use crate::error::LeaseError;
use crate::identity::ResourceId;

use super::models::{AcquireOutcome, LeaseResult, ReleaseOutcome};
use super::repository::ResourceRepository;

pub const DEFAULT_LOCK_TIMEOUT_SECONDS: i64 = 300;

/// Lease policy passed to the reaper and allocator at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Staleness threshold: a lease acquired at `T` is reaped at `T + lock_timeout`.
    pub lock_timeout: Duration,
}

impl LeaseConfig {
    /// Fails with `Validation` when the timeout does not fit a `Duration`.
    pub fn from_seconds(lock_timeout_seconds: i64) -> Result<Self, LeaseError> {
        let lock_timeout = Duration::try_seconds(lock_timeout_seconds).ok_or_else(|| {
            LeaseError::Validation(format!(
                "lock timeout of {lock_timeout_seconds}s is out of range"
            ))
        })?;
        Ok(Self { lock_timeout })
    }

    /// Leases acquired at or before this instant are stale at `now`.
    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, LeaseError> {
        now.checked_sub_signed(self.lock_timeout).ok_or_else(|| {
            LeaseError::Validation(format!(
                "lock timeout {} reaches past the earliest representable time",
                self.lock_timeout
            ))
        })
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECONDS),
        }
    }
}

/// Lease manager abstraction.
pub trait LeaseManager: Send + Sync {
    /// Lease `id` for the caller. Fails with `NotFound` or `Conflict`.
    fn acquire(&self, id: &ResourceId) -> Result<LeaseResult, LeaseError>;

    /// Release `id`. Releasing a free resource succeeds with "was not locked".
    fn release(&self, id: &ResourceId) -> Result<LeaseResult, LeaseError>;
}

/// Lease manager backed by a `ResourceRepository`.
pub struct RepositoryLeaseManager<R: ResourceRepository> {
    repository: R,
    clock: SharedClock,
}

impl<R: ResourceRepository> RepositoryLeaseManager<R> {
    pub fn new(repository: R) -> Self {
        Self::with_clock(repository, std::sync::Arc::new(SystemClock))
    }

    pub fn with_clock(repository: R, clock: SharedClock) -> Self {
        Self { repository, clock }
    }
}

impl<R: ResourceRepository> LeaseManager for RepositoryLeaseManager<R> {
    fn acquire(&self, id: &ResourceId) -> Result<LeaseResult, LeaseError> {
        let now = self.clock.now();
        match self.repository.try_acquire(id, now)? {
            AcquireOutcome::Acquired(record) => {
                tracing::debug!(
                    resource_id = %id,
                    lease_expiry = ?record.lease_expiry,
                    "lease acquired"
                );
                Ok(LeaseResult::locked(&record))
            }
            AcquireOutcome::AlreadyLocked => {
                tracing::debug!(resource_id = %id, "lease conflict");
                Err(LeaseError::Conflict(*id))
            }
            AcquireOutcome::Missing => Err(LeaseError::NotFound(*id)),
        }
    }

    fn release(&self, id: &ResourceId) -> Result<LeaseResult, LeaseError> {
        match self.repository.release(id)? {
            ReleaseOutcome::Released(record) => {
                tracing::debug!(resource_id = %record.id, "lease released");
                Ok(LeaseResult::unlocked(record.id))
            }
            ReleaseOutcome::NotLocked(record) => Ok(LeaseResult::not_locked(record.id)),
            ReleaseOutcome::Missing => Err(LeaseError::NotFound(*id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::runtime::memory_repository::InMemoryResourceRepository;
    use crate::runtime::models::{MSG_LOCKED, MSG_NOT_LOCKED, MSG_UNLOCKED};
    use crate::runtime::test_support::seed_resource;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn default_lock_timeout_is_five_minutes() {
        assert_eq!(LeaseConfig::default().lock_timeout, Duration::seconds(300));
        assert_eq!(
            LeaseConfig::from_seconds(1).unwrap().stale_cutoff(t0()),
            Ok(t0() - Duration::seconds(1))
        );
    }

    #[test]
    fn oversized_lock_timeouts_are_errors_not_panics() {
        assert!(matches!(
            LeaseConfig::from_seconds(i64::MAX),
            Err(LeaseError::Validation(_))
        ));

        let config = LeaseConfig::from_seconds(10_000_000_000_000).unwrap();
        assert!(matches!(
            config.stale_cutoff(t0()),
            Err(LeaseError::Validation(_))
        ));
    }

    #[test]
    fn acquire_then_release_walks_the_state_machine() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let id = seed_resource(&repo, "a@example.com", t0());
        clock.advance(Duration::seconds(1));
        let manager = RepositoryLeaseManager::with_clock(repo.clone(), clock.clone());

        let locked = manager.acquire(&id).unwrap();
        assert!(locked.locked);
        assert_eq!(locked.lease_expiry, Some(t0() + Duration::seconds(1)));
        assert_eq!(locked.message, MSG_LOCKED);

        assert_eq!(manager.acquire(&id), Err(LeaseError::Conflict(id)));

        let released = manager.release(&id).unwrap();
        assert!(!released.locked);
        assert_eq!(released.lease_expiry, None);
        assert_eq!(released.message, MSG_UNLOCKED);

        let again = manager.release(&id).unwrap();
        assert!(!again.locked);
        assert_eq!(again.message, MSG_NOT_LOCKED);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let manager = RepositoryLeaseManager::new(repo);
        let id = ResourceId::new();
        assert_eq!(manager.acquire(&id), Err(LeaseError::NotFound(id)));
        assert_eq!(manager.release(&id), Err(LeaseError::NotFound(id)));
    }

    #[test]
    fn acquire_does_not_reap_an_expired_lease() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let id = seed_resource(&repo, "a@example.com", t0());
        let manager = RepositoryLeaseManager::with_clock(repo, clock.clone());

        manager.acquire(&id).unwrap();
        clock.advance(Duration::days(1));
        assert_eq!(manager.acquire(&id), Err(LeaseError::Conflict(id)));
    }

    #[test]
    fn concurrent_acquires_have_exactly_one_winner() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let id = seed_resource(&repo, "a@example.com", t0());
        let manager = Arc::new(RepositoryLeaseManager::new(repo));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.acquire(&id))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(LeaseError::Conflict(_))))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 15);
    }
}

//! Lease reaper: clears leases older than the configured timeout.

use chrono::{DateTime, Utc};

use crate::error::LeaseError;

use super::lease::LeaseConfig;
use super::repository::ResourceRepository;

/// Stateless sweep over the resource table.
///
/// One bulk conditional update per call; never read-then-write per row, so it
/// cannot clobber a lease taken concurrently after the cutoff.
pub struct LeaseReaper<R: ResourceRepository> {
    repository: R,
    config: LeaseConfig,
}

impl<R: ResourceRepository> LeaseReaper<R> {
    pub fn new(repository: R, config: LeaseConfig) -> Self {
        Self { repository, config }
    }

    /// Clear every lease with `now - lease_expiry >= lock_timeout`.
    ///
    /// The returned count is informational.
    pub fn reap(&self, now: DateTime<Utc>) -> Result<u64, LeaseError> {
        let cutoff = self.config.stale_cutoff(now)?;
        let reaped = self.repository.clear_stale_leases(cutoff)?;
        if reaped > 0 {
            tracing::info!(reaped, %cutoff, "reaped stale leases");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::runtime::memory_repository::InMemoryResourceRepository;
    use crate::runtime::models::{AcquireOutcome, LeaseState};
    use crate::runtime::test_support::seed_resource;

    #[test]
    fn reaps_exactly_at_the_timeout_boundary() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let repo = Arc::new(InMemoryResourceRepository::new());
        let id = seed_resource(&repo, "a@example.com", t0);
        assert!(matches!(
            repo.try_acquire(&id, t0).unwrap(),
            AcquireOutcome::Acquired(_)
        ));

        let reaper = LeaseReaper::new(repo.clone(), LeaseConfig::from_seconds(10).unwrap());
        assert_eq!(reaper.reap(t0 + Duration::milliseconds(9_999)).unwrap(), 0);
        assert_eq!(
            repo.get_resource(&id).unwrap().unwrap().state(),
            LeaseState::Leased
        );

        assert_eq!(reaper.reap(t0 + Duration::seconds(10)).unwrap(), 1);
        assert_eq!(
            repo.get_resource(&id).unwrap().unwrap().state(),
            LeaseState::Free
        );
    }

    #[test]
    fn leaves_free_and_fresh_leases_alone() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let repo = Arc::new(InMemoryResourceRepository::new());
        let free = seed_resource(&repo, "free@example.com", t0);
        let fresh = seed_resource(&repo, "fresh@example.com", t0);
        repo.try_acquire(&fresh, t0 + Duration::seconds(50)).unwrap();

        let reaper = LeaseReaper::new(repo.clone(), LeaseConfig::from_seconds(60).unwrap());
        assert_eq!(reaper.reap(t0 + Duration::seconds(100)).unwrap(), 0);
        assert_eq!(repo.get_resource(&free).unwrap().unwrap().lease_expiry, None);
        assert!(repo.get_resource(&fresh).unwrap().unwrap().lease_expiry.is_some());
    }
}

//! Allocator: hands out free resources oldest-created-first.

use std::sync::Arc;

use crate::clock::{SharedClock, SystemClock};
use crate::error::LeaseError;

use super::lease::LeaseConfig;
use super::models::{LeaseResult, ResourceRecord};
use super::reaper::LeaseReaper;
use super::repository::ResourceRepository;

/// Picks free resources from the pool. The reaper runs first on every call.
pub struct ResourceAllocator<R: ResourceRepository + Clone> {
    repository: R,
    reaper: LeaseReaper<R>,
    clock: SharedClock,
}

impl<R: ResourceRepository + Clone> ResourceAllocator<R> {
    pub fn new(repository: R, config: LeaseConfig) -> Self {
        Self::with_clock(repository, config, Arc::new(SystemClock))
    }

    pub fn with_clock(repository: R, config: LeaseConfig, clock: SharedClock) -> Self {
        Self {
            reaper: LeaseReaper::new(repository.clone(), config),
            repository,
            clock,
        }
    }

    pub fn reaper(&self) -> &LeaseReaper<R> {
        &self.reaper
    }

    /// Reap, then return the oldest free resource without leasing it.
    ///
    /// Two callers may pick the same resource; the slower one gets
    /// `Conflict` from the follow-up acquire and should pick again. The reap
    /// stays committed even when the pool turns out to be exhausted.
    pub fn pick_free_resource(&self) -> Result<ResourceRecord, LeaseError> {
        let now = self.clock.now();
        self.reaper.reap(now)?;
        self.repository
            .list_free_resources(1)?
            .into_iter()
            .next()
            .ok_or(LeaseError::ResourceExhausted)
    }

    /// Reap, then pick and lease the oldest free resource in one store
    /// transaction. Concurrent callers always get distinct resources.
    pub fn acquire_free_resource(&self) -> Result<LeaseResult, LeaseError> {
        let now = self.clock.now();
        self.reaper.reap(now)?;
        match self.repository.acquire_oldest_free(now)? {
            Some(record) => {
                tracing::debug!(resource_id = %record.id, "free resource leased");
                Ok(LeaseResult::locked(&record))
            }
            None => Err(LeaseError::ResourceExhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::runtime::lease::{LeaseManager, RepositoryLeaseManager};
    use crate::runtime::memory_repository::InMemoryResourceRepository;
    use crate::runtime::test_support::seed_resource;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn picks_oldest_free_resource_first() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let clock = Arc::new(ManualClock::new(t0() + Duration::seconds(10)));
        let b = seed_resource(&repo, "b@example.com", t0() + Duration::seconds(1));
        let a = seed_resource(&repo, "a@example.com", t0());
        let allocator =
            ResourceAllocator::with_clock(repo.clone(), LeaseConfig::default(), clock.clone());
        let leases = RepositoryLeaseManager::with_clock(repo, clock);

        assert_eq!(allocator.pick_free_resource().unwrap().id, a);
        assert_eq!(allocator.pick_free_resource().unwrap().id, a);
        leases.acquire(&a).unwrap();
        assert_eq!(allocator.pick_free_resource().unwrap().id, b);
    }

    #[test]
    fn exhausted_pool_is_reported() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let allocator =
            ResourceAllocator::with_clock(repo.clone(), LeaseConfig::default(), clock.clone());
        assert_eq!(allocator.pick_free_resource(), Err(LeaseError::ResourceExhausted));

        let a = seed_resource(&repo, "a@example.com", t0());
        RepositoryLeaseManager::with_clock(repo, clock)
            .acquire(&a)
            .unwrap();
        assert_eq!(allocator.pick_free_resource(), Err(LeaseError::ResourceExhausted));
        assert_eq!(allocator.acquire_free_resource(), Err(LeaseError::ResourceExhausted));
    }

    #[test]
    fn stale_lease_is_reaped_on_pick() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let a = seed_resource(&repo, "a@example.com", t0());
        let config = LeaseConfig::from_seconds(1).unwrap();
        let allocator = ResourceAllocator::with_clock(repo.clone(), config, clock.clone());
        RepositoryLeaseManager::with_clock(repo, clock.clone())
            .acquire(&a)
            .unwrap();

        clock.advance(Duration::milliseconds(999));
        assert_eq!(allocator.pick_free_resource(), Err(LeaseError::ResourceExhausted));

        clock.advance(Duration::seconds(1));
        assert_eq!(allocator.pick_free_resource().unwrap().id, a);
    }

    #[test]
    fn atomic_acquire_hands_out_distinct_resources() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        for i in 0..8 {
            seed_resource(&repo, &format!("bot{i}@example.com"), t0() + Duration::seconds(i));
        }
        let allocator = Arc::new(ResourceAllocator::new(repo, LeaseConfig::default()));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.acquire_free_resource())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ids: HashSet<_> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|l| l.id)
            .collect();
        assert_eq!(ids.len(), 8);
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(LeaseError::ResourceExhausted)))
            .count();
        assert_eq!(exhausted, 4);
    }

    #[test]
    fn out_of_range_timeout_fails_the_call_instead_of_panicking() {
        let repo = Arc::new(InMemoryResourceRepository::new());
        seed_resource(&repo, "a@example.com", t0());
        let config = LeaseConfig::from_seconds(10_000_000_000_000).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let allocator = ResourceAllocator::with_clock(repo, config, clock);

        assert!(matches!(
            allocator.pick_free_resource(),
            Err(LeaseError::Validation(_))
        ));
        assert!(matches!(
            allocator.acquire_free_resource(),
            Err(LeaseError::Validation(_))
        ));
    }
}

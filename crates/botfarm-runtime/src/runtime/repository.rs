//! Storage façade for lease and directory operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::LeaseError;
use crate::identity::ResourceId;

use super::models::{AcquireOutcome, ReleaseOutcome, ResourceRecord};

/// Resource store contract used by the allocator, the lease manager and the
/// directory.
///
/// Implementations make every lease transition a single all-or-nothing
/// transaction:
/// - `try_acquire` sets the lease only if it is currently null, so two
///   concurrent calls on one id cannot both succeed.
/// - `clear_stale_leases` is one bulk conditional update.
/// - `acquire_oldest_free` selects and leases the oldest free resource in the
///   same transaction.
///
/// Coordination happens in the store, never in process memory, because several
/// service processes may share one database.
pub trait ResourceRepository: Send + Sync {
    /// Insert a new record. A taken login yields `DuplicateLogin`.
    fn insert_resource(&self, record: &ResourceRecord) -> Result<(), LeaseError>;

    fn get_resource(&self, id: &ResourceId) -> Result<Option<ResourceRecord>, LeaseError>;

    fn find_by_login(&self, login: &str) -> Result<Option<ResourceRecord>, LeaseError>;

    /// All records, newest first.
    fn list_resources(&self) -> Result<Vec<ResourceRecord>, LeaseError>;

    /// Free records in allocation order (oldest `created_at`, then id).
    fn list_free_resources(&self, limit: usize) -> Result<Vec<ResourceRecord>, LeaseError>;

    /// Lease `id` at `now` if and only if it is free.
    fn try_acquire(&self, id: &ResourceId, now: DateTime<Utc>)
        -> Result<AcquireOutcome, LeaseError>;

    /// Clear the lease on `id`.
    fn release(&self, id: &ResourceId) -> Result<ReleaseOutcome, LeaseError>;

    /// Clear every lease acquired at or before `stale_at`. Returns how many
    /// leases were cleared.
    fn clear_stale_leases(&self, stale_at: DateTime<Utc>) -> Result<u64, LeaseError>;

    /// Lease the oldest free resource at `now`, atomically.
    fn acquire_oldest_free(&self, now: DateTime<Utc>)
        -> Result<Option<ResourceRecord>, LeaseError>;

    /// Cheap liveness check used by the health endpoint.
    fn ping(&self) -> Result<(), LeaseError> {
        Ok(())
    }
}

pub type SharedResourceRepository = Arc<dyn ResourceRepository>;

impl<R: ResourceRepository + ?Sized> ResourceRepository for Arc<R> {
    fn insert_resource(&self, record: &ResourceRecord) -> Result<(), LeaseError> {
        (**self).insert_resource(record)
    }

    fn get_resource(&self, id: &ResourceId) -> Result<Option<ResourceRecord>, LeaseError> {
        (**self).get_resource(id)
    }

    fn find_by_login(&self, login: &str) -> Result<Option<ResourceRecord>, LeaseError> {
        (**self).find_by_login(login)
    }

    fn list_resources(&self) -> Result<Vec<ResourceRecord>, LeaseError> {
        (**self).list_resources()
    }

    fn list_free_resources(&self, limit: usize) -> Result<Vec<ResourceRecord>, LeaseError> {
        (**self).list_free_resources(limit)
    }

    fn try_acquire(
        &self,
        id: &ResourceId,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, LeaseError> {
        (**self).try_acquire(id, now)
    }

    fn release(&self, id: &ResourceId) -> Result<ReleaseOutcome, LeaseError> {
        (**self).release(id)
    }

    fn clear_stale_leases(&self, stale_at: DateTime<Utc>) -> Result<u64, LeaseError> {
        (**self).clear_stale_leases(stale_at)
    }

    fn acquire_oldest_free(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceRecord>, LeaseError> {
        (**self).acquire_oldest_free(now)
    }

    fn ping(&self) -> Result<(), LeaseError> {
        (**self).ping()
    }
}

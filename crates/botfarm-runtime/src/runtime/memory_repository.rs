//! In-process resource store.
//!
//! The table lives behind one mutex, which plays the part of the database's
//! transaction isolation. Suitable for tests and single-process deployments;
//! multi-process deployments need the SQLite or Postgres store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{map_driver_err, LeaseError};
use crate::identity::ResourceId;

use super::models::{AcquireOutcome, ReleaseOutcome, ResourceRecord};
use super::repository::ResourceRepository;

#[derive(Debug, Default)]
pub struct InMemoryResourceRepository {
    rows: Mutex<HashMap<ResourceId, ResourceRecord>>,
}

impl InMemoryResourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, HashMap<ResourceId, ResourceRecord>>, LeaseError> {
        self.rows
            .lock()
            .map_err(|e| map_driver_err("in-memory store poisoned", e))
    }
}

fn oldest_free(rows: &HashMap<ResourceId, ResourceRecord>) -> Option<ResourceId> {
    rows.values()
        .filter(|r| r.lease_expiry.is_none())
        .min_by_key(|r| r.allocation_key())
        .map(|r| r.id)
}

impl ResourceRepository for InMemoryResourceRepository {
    fn insert_resource(&self, record: &ResourceRecord) -> Result<(), LeaseError> {
        let mut rows = self.rows()?;
        if rows.values().any(|r| r.login == record.login) {
            return Err(LeaseError::DuplicateLogin(record.login.clone()));
        }
        if rows.contains_key(&record.id) {
            return Err(LeaseError::Store(format!(
                "duplicate resource id: {}",
                record.id
            )));
        }
        rows.insert(record.id, record.clone());
        Ok(())
    }

    fn get_resource(&self, id: &ResourceId) -> Result<Option<ResourceRecord>, LeaseError> {
        Ok(self.rows()?.get(id).cloned())
    }

    fn find_by_login(&self, login: &str) -> Result<Option<ResourceRecord>, LeaseError> {
        Ok(self.rows()?.values().find(|r| r.login == login).cloned())
    }

    fn list_resources(&self) -> Result<Vec<ResourceRecord>, LeaseError> {
        let mut all: Vec<_> = self.rows()?.values().cloned().collect();
        all.sort_by(|a, b| b.allocation_key().cmp(&a.allocation_key()));
        Ok(all)
    }

    fn list_free_resources(&self, limit: usize) -> Result<Vec<ResourceRecord>, LeaseError> {
        let mut free: Vec<_> = self
            .rows()?
            .values()
            .filter(|r| r.lease_expiry.is_none())
            .cloned()
            .collect();
        free.sort_by_key(|r| r.allocation_key());
        free.truncate(limit);
        Ok(free)
    }

    fn try_acquire(
        &self,
        id: &ResourceId,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, LeaseError> {
        let mut rows = self.rows()?;
        let Some(row) = rows.get_mut(id) else {
            return Ok(AcquireOutcome::Missing);
        };
        if row.lease_expiry.is_some() {
            return Ok(AcquireOutcome::AlreadyLocked);
        }
        row.lease_expiry = Some(now);
        Ok(AcquireOutcome::Acquired(row.clone()))
    }

    fn release(&self, id: &ResourceId) -> Result<ReleaseOutcome, LeaseError> {
        let mut rows = self.rows()?;
        let Some(row) = rows.get_mut(id) else {
            return Ok(ReleaseOutcome::Missing);
        };
        if row.lease_expiry.take().is_some() {
            Ok(ReleaseOutcome::Released(row.clone()))
        } else {
            Ok(ReleaseOutcome::NotLocked(row.clone()))
        }
    }

    fn clear_stale_leases(&self, stale_at: DateTime<Utc>) -> Result<u64, LeaseError> {
        let mut rows = self.rows()?;
        let mut cleared = 0;
        for row in rows.values_mut() {
            if row.lease_expiry.is_some_and(|acquired| acquired <= stale_at) {
                row.lease_expiry = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    fn acquire_oldest_free(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceRecord>, LeaseError> {
        let mut rows = self.rows()?;
        let Some(id) = oldest_free(&rows) else {
            return Ok(None);
        };
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| LeaseError::Store(format!("row vanished: {id}")))?;
        row.lease_expiry = Some(now);
        Ok(Some(row.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::assert_repository_contract;

    #[test]
    fn in_memory_repository_contract() {
        let repo = InMemoryResourceRepository::new();
        assert_repository_contract(&repo);
    }
}

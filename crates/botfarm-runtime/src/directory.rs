//! Directory of bot accounts: registration and lookup.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::error::LeaseError;
use crate::identity::ResourceId;
use crate::runtime::models::{ResourceDomain, ResourceEnv, ResourceRecord};
use crate::runtime::repository::ResourceRepository;
use crate::security::PasswordHasher;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Registration input. The password arrives in clear text and is hashed
/// before it reaches the store.
#[derive(Clone, Debug, Deserialize)]
pub struct NewResource {
    pub login: String,
    pub password: String,
    pub project_id: Uuid,
    pub env: ResourceEnv,
    pub domain: ResourceDomain,
}

fn validate_login(login: &str) -> Result<(), LeaseError> {
    let invalid = || LeaseError::Validation(format!("login must be an e-mail address: {login:?}"));
    let (local, domain) = login.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.contains('@')
        || login.chars().any(char::is_whitespace)
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
    {
        return Err(invalid());
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), LeaseError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(LeaseError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub struct DirectoryService<R: ResourceRepository> {
    repository: R,
    hasher: PasswordHasher,
    clock: SharedClock,
}

impl<R: ResourceRepository> DirectoryService<R> {
    pub fn new(repository: R) -> Self {
        Self::with_parts(repository, PasswordHasher::default(), Arc::new(SystemClock))
    }

    pub fn with_parts(repository: R, hasher: PasswordHasher, clock: SharedClock) -> Self {
        Self {
            repository,
            hasher,
            clock,
        }
    }

    pub fn hasher(&self) -> &PasswordHasher {
        &self.hasher
    }

    /// Register a new, free resource.
    pub fn create(&self, new: NewResource) -> Result<ResourceRecord, LeaseError> {
        let login = new.login.trim().to_string();
        validate_login(&login)?;
        validate_password(&new.password)?;

        // The store's unique constraint is authoritative; this check only
        // avoids hashing for an obvious duplicate.
        if self.find_by_login(&login)?.is_some() {
            return Err(LeaseError::DuplicateLogin(login));
        }

        let record = ResourceRecord {
            id: ResourceId::new(),
            created_at: self.clock.now(),
            login,
            password_hash: self.hasher.hash(&new.password)?,
            project_id: new.project_id,
            env: new.env,
            domain: new.domain,
            lease_expiry: None,
        };
        self.repository.insert_resource(&record)?;
        tracing::info!(resource_id = %record.id, login = %record.login, "resource registered");
        Ok(record)
    }

    /// All resources, newest first.
    pub fn list(&self) -> Result<Vec<ResourceRecord>, LeaseError> {
        self.repository.list_resources()
    }

    pub fn get(&self, id: &ResourceId) -> Result<ResourceRecord, LeaseError> {
        self.repository
            .get_resource(id)?
            .ok_or(LeaseError::NotFound(*id))
    }

    /// Look up a resource by its exact, already trimmed login.
    pub fn find_by_login(&self, login: &str) -> Result<Option<ResourceRecord>, LeaseError> {
        self.repository.find_by_login(login)
    }
}

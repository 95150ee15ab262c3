//! Login/password authentication and bearer token checks.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::clock::{SharedClock, SystemClock};
use crate::error::LeaseError;
use crate::identity::ResourceId;
use crate::runtime::models::ResourceRecord;
use crate::runtime::repository::ResourceRepository;
use crate::security::{PasswordHasher, TokenSigner};

pub const DEFAULT_TOKEN_TTL_MINUTES: i64 = 60;

pub const MSG_BAD_LOGIN: &str = "Incorrect login or password";
pub const MSG_BAD_CREDENTIALS: &str = "Could not validate credentials";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
}

pub struct AuthGate<R: ResourceRepository> {
    repository: R,
    hasher: PasswordHasher,
    signer: TokenSigner,
    token_ttl: Duration,
    clock: SharedClock,
}

impl<R: ResourceRepository> AuthGate<R> {
    pub fn new(repository: R, signer: TokenSigner, token_ttl: Duration) -> Self {
        Self::with_parts(
            repository,
            PasswordHasher::default(),
            signer,
            token_ttl,
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        repository: R,
        hasher: PasswordHasher,
        signer: TokenSigner,
        token_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            hasher,
            signer,
            token_ttl,
            clock,
        }
    }

    /// Exchange login and password for a bearer token.
    pub fn authenticate(&self, login: &str, password: &str) -> Result<AccessToken, LeaseError> {
        let record = self
            .repository
            .find_by_login(login.trim())?
            .filter(|r| self.hasher.verify(password, &r.password_hash))
            .ok_or_else(|| LeaseError::Unauthorized(MSG_BAD_LOGIN.to_string()))?;

        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.token_ttl)
            .ok_or_else(|| {
                LeaseError::Validation(format!("token lifetime {} is out of range", self.token_ttl))
            })?;
        let access_token = self.signer.sign(&record.id.to_string(), expires_at)?;
        tracing::debug!(resource_id = %record.id, "access token issued");
        Ok(AccessToken {
            access_token,
            token_type: "bearer".to_string(),
        })
    }

    /// Resolve a bearer token to the resource it was issued for.
    pub fn authorize(&self, bearer: &str) -> Result<ResourceRecord, LeaseError> {
        let unauthorized = || LeaseError::Unauthorized(MSG_BAD_CREDENTIALS.to_string());
        let subject = self
            .signer
            .verify(bearer.trim(), self.clock.now())
            .ok_or_else(unauthorized)?;
        let id: ResourceId = subject.parse().map_err(|_| unauthorized())?;
        self.repository.get_resource(&id)?.ok_or_else(unauthorized)
    }
}

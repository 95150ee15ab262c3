//! Records and result values exchanged with the resource store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LeaseError;
use crate::identity::ResourceId;

/// Deployment environment a bot account belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceEnv {
    Prod,
    Preprod,
    Stage,
}

impl ResourceEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Preprod => "preprod",
            Self::Stage => "stage",
        }
    }
}

impl FromStr for ResourceEnv {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" => Ok(Self::Prod),
            "preprod" => Ok(Self::Preprod),
            "stage" => Ok(Self::Stage),
            other => Err(LeaseError::Validation(format!(
                "env must be one of prod, preprod, stage (got {other:?})"
            ))),
        }
    }
}

impl fmt::Display for ResourceEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic class of a bot account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDomain {
    Canary,
    Regular,
}

impl ResourceDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canary => "canary",
            Self::Regular => "regular",
        }
    }
}

impl FromStr for ResourceDomain {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "canary" => Ok(Self::Canary),
            "regular" => Ok(Self::Regular),
            other => Err(LeaseError::Validation(format!(
                "domain must be one of canary, regular (got {other:?})"
            ))),
        }
    }
}

impl fmt::Display for ResourceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease state of a single resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Free,
    Leased,
}

/// One row of the resource table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    /// Set once at creation; allocation order key.
    pub created_at: DateTime<Utc>,
    pub login: String,
    pub password_hash: String,
    pub project_id: Uuid,
    pub env: ResourceEnv,
    pub domain: ResourceDomain,
    /// Moment the current lease was acquired; `None` while free. The lease
    /// deadline is `lease_expiry + lock_timeout`, computed at read time.
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    pub fn state(&self) -> LeaseState {
        if self.lease_expiry.is_some() {
            LeaseState::Leased
        } else {
            LeaseState::Free
        }
    }

    /// Total allocation order: oldest `created_at` first, ties broken by id.
    pub fn allocation_key(&self) -> (DateTime<Utc>, ResourceId) {
        (self.created_at, self.id)
    }
}

/// Outcome of a store-level conditional acquire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(ResourceRecord),
    AlreadyLocked,
    Missing,
}

/// Outcome of a store-level release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(ResourceRecord),
    NotLocked(ResourceRecord),
    Missing,
}

/// Millisecond timestamps are the on-disk representation in SQL stores.
#[cfg_attr(
    not(any(feature = "sqlite-persistence", feature = "kernel-postgres")),
    allow(dead_code)
)]
pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg_attr(
    not(any(feature = "sqlite-persistence", feature = "kernel-postgres")),
    allow(dead_code)
)]
pub(crate) fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, LeaseError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LeaseError::Store(format!("timestamp out of range: {ms}")))
}

pub const MSG_LOCKED: &str = "successfully locked";
pub const MSG_UNLOCKED: &str = "successfully unlocked";
pub const MSG_NOT_LOCKED: &str = "was not locked";

/// Immutable result of a lease transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseResult {
    pub id: ResourceId,
    pub locked: bool,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub message: String,
}

impl LeaseResult {
    pub fn locked(record: &ResourceRecord) -> Self {
        Self {
            id: record.id,
            locked: true,
            lease_expiry: record.lease_expiry,
            message: MSG_LOCKED.to_string(),
        }
    }

    pub fn unlocked(id: ResourceId) -> Self {
        Self {
            id,
            locked: false,
            lease_expiry: None,
            message: MSG_UNLOCKED.to_string(),
        }
    }

    pub fn not_locked(id: ResourceId) -> Self {
        Self {
            id,
            locked: false,
            lease_expiry: None,
            message: MSG_NOT_LOCKED.to_string(),
        }
    }
}

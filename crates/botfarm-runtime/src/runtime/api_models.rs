//! Request and response bodies of the lease API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::NewResource;
use crate::identity::ResourceId;

use super::models::{ResourceDomain, ResourceEnv, ResourceRecord};

#[derive(Clone, Debug, Deserialize)]
pub struct CreateResourceRequest {
    pub login: String,
    pub password: String,
    pub project_id: Uuid,
    pub env: ResourceEnv,
    pub domain: ResourceDomain,
}

impl From<CreateResourceRequest> for NewResource {
    fn from(req: CreateResourceRequest) -> Self {
        Self {
            login: req.login,
            password: req.password,
            project_id: req.project_id,
            env: req.env,
            domain: req.domain,
        }
    }
}

/// Public view of a resource. The password hash never leaves the service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub login: String,
    pub project_id: Uuid,
    pub env: ResourceEnv,
    pub domain: ResourceDomain,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl From<ResourceRecord> for ResourceResponse {
    fn from(record: ResourceRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            login: record.login,
            project_id: record.project_id,
            env: record.env,
            domain: record.domain,
            lease_expiry: record.lease_expiry,
        }
    }
}

pub type AcquireResponse = super::models::LeaseResult;

/// OAuth2 password-grant form.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: DateTime<Utc>,
    pub db: DbHealth,
}

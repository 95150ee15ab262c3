//! Axum router for the lease API.
//!
//! Store calls are synchronous, so every handler moves its work onto the
//! blocking pool with `spawn_blocking`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Duration;
use serde_json::json;

use crate::auth::{AccessToken, AuthGate};
use crate::clock::{SharedClock, SystemClock};
use crate::directory::DirectoryService;
use crate::error::LeaseError;
use crate::identity::ResourceId;
use crate::security::{PasswordHasher, TokenSigner};

use super::allocator::ResourceAllocator;
use super::api_errors::ApiError;
use super::api_models::{
    AcquireResponse, CreateResourceRequest, DbHealth, HealthResponse, ResourceResponse,
    TokenRequest,
};
use super::lease::{LeaseConfig, LeaseManager, RepositoryLeaseManager};
use super::models::ResourceRecord;
use super::repository::{ResourceRepository, SharedResourceRepository};

const MSG_NOT_AUTHENTICATED: &str = "Not authenticated";

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct ApiState {
    repository: SharedResourceRepository,
    directory: Arc<DirectoryService<SharedResourceRepository>>,
    auth: Arc<AuthGate<SharedResourceRepository>>,
    allocator: Arc<ResourceAllocator<SharedResourceRepository>>,
    leases: Arc<RepositoryLeaseManager<SharedResourceRepository>>,
    clock: SharedClock,
}

impl ApiState {
    pub fn new(
        repository: SharedResourceRepository,
        lease_config: LeaseConfig,
        signer: TokenSigner,
        token_ttl: Duration,
    ) -> Self {
        Self::with_parts(
            repository,
            lease_config,
            signer,
            token_ttl,
            PasswordHasher::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        repository: SharedResourceRepository,
        lease_config: LeaseConfig,
        signer: TokenSigner,
        token_ttl: Duration,
        hasher: PasswordHasher,
        clock: SharedClock,
    ) -> Self {
        Self {
            directory: Arc::new(DirectoryService::with_parts(
                repository.clone(),
                hasher,
                clock.clone(),
            )),
            auth: Arc::new(AuthGate::with_parts(
                repository.clone(),
                hasher,
                signer,
                token_ttl,
                clock.clone(),
            )),
            allocator: Arc::new(ResourceAllocator::with_clock(
                repository.clone(),
                lease_config,
                clock.clone(),
            )),
            leases: Arc::new(RepositoryLeaseManager::with_clock(
                repository.clone(),
                clock.clone(),
            )),
            repository,
            clock,
        }
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator<SharedResourceRepository>> {
        &self.allocator
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        .route("/api/v1/token", post(issue_token))
        .route("/api/v1/users", post(create_resource).get(list_resources))
        .route("/api/v1/users/", post(create_resource).get(list_resources))
        .route("/api/v1/users/free", get(free_resource))
        .route("/api/v1/users/acquire", post(acquire_free_resource))
        .route("/api/v1/users/:id/acquire", post(acquire_resource))
        .route("/api/v1/users/:id/release", post(release_resource))
        .with_state(state)
}

async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, LeaseError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            tracing::error!(error = %e, "blocking store task failed");
            Err(ApiError::internal("internal error"))
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return None;
    }
    Some(token.trim().to_string())
}

async fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<ResourceRecord, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| {
        ApiError::from(LeaseError::Unauthorized(MSG_NOT_AUTHENTICATED.to_string()))
    })?;
    let auth = state.auth.clone();
    run_blocking(move || auth.authorize(&token)).await
}

async fn create_resource(
    State(state): State<ApiState>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<ResourceResponse>), ApiError> {
    let directory = state.directory.clone();
    let record = run_blocking(move || directory.create(req.into())).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

async fn list_resources(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ResourceResponse>>, ApiError> {
    authorize(&state, &headers).await?;
    let directory = state.directory.clone();
    let records = run_blocking(move || directory.list()).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

async fn free_resource(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ResourceResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let allocator = state.allocator.clone();
    let record = run_blocking(move || allocator.pick_free_resource()).await?;
    Ok(Json(record.into()))
}

async fn acquire_free_resource(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<AcquireResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let allocator = state.allocator.clone();
    Ok(Json(run_blocking(move || allocator.acquire_free_resource()).await?))
}

async fn acquire_resource(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<ResourceId>,
) -> Result<Json<AcquireResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let leases = state.leases.clone();
    Ok(Json(run_blocking(move || leases.acquire(&id)).await?))
}

async fn release_resource(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<ResourceId>,
) -> Result<Json<AcquireResponse>, ApiError> {
    authorize(&state, &headers).await?;
    let leases = state.leases.clone();
    Ok(Json(run_blocking(move || leases.release(&id)).await?))
}

async fn issue_token(
    State(state): State<ApiState>,
    Form(req): Form<TokenRequest>,
) -> Result<Json<AccessToken>, ApiError> {
    let auth = state.auth.clone();
    let token = run_blocking(move || auth.authenticate(&req.username, &req.password)).await?;
    Ok(Json(token))
}

async fn health(State(state): State<ApiState>) -> Response {
    let repository = state.repository.clone();
    let ping = tokio::task::spawn_blocking(move || repository.ping())
        .await
        .unwrap_or_else(|e| Err(LeaseError::Store(format!("health task failed: {e}"))));

    match ping {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
            time: state.clock.now(),
            db: DbHealth {
                status: "ok".to_string(),
                error: None,
            },
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            let db = DbHealth {
                status: "error".to_string(),
                error: Some(e.to_string()),
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "detail": { "db": db } })),
            )
                .into_response()
        }
    }
}

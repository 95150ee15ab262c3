//! Lease engine: the resource store contract, its backends, the reaper, the
//! allocator and the lease manager.

pub mod allocator;
#[cfg(feature = "execution-server")]
pub mod api_errors;
#[cfg(feature = "execution-server")]
pub mod api_handlers;
#[cfg(feature = "execution-server")]
pub mod api_models;
pub mod backend_config;
pub mod lease;
pub mod memory_repository;
pub mod models;
#[cfg(feature = "kernel-postgres")]
pub mod postgres_repository;
pub mod reaper;
pub mod repository;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_repository;
#[cfg(test)]
pub(crate) mod test_support;

pub use allocator::ResourceAllocator;
#[cfg(feature = "execution-server")]
pub use api_errors::ApiError;
#[cfg(feature = "execution-server")]
pub use api_handlers::{build_router, ApiState};
#[cfg(feature = "execution-server")]
pub use api_models::{
    AcquireResponse, CreateResourceRequest, HealthResponse, ResourceResponse, TokenRequest,
};
pub use backend_config::{RuntimeStorageBackend, RuntimeStorageConfig};
pub use lease::{LeaseConfig, LeaseManager, RepositoryLeaseManager, DEFAULT_LOCK_TIMEOUT_SECONDS};
pub use memory_repository::InMemoryResourceRepository;
pub use models::{
    AcquireOutcome, LeaseResult, LeaseState, ReleaseOutcome, ResourceDomain, ResourceEnv,
    ResourceRecord, MSG_LOCKED, MSG_NOT_LOCKED, MSG_UNLOCKED,
};
#[cfg(feature = "kernel-postgres")]
pub use postgres_repository::PostgresResourceRepository;
pub use reaper::LeaseReaper;
pub use repository::{ResourceRepository, SharedResourceRepository};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_repository::SqliteResourceRepository;

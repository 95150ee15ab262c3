//! Storage backend selection for the resource store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::LeaseError;

use super::memory_repository::InMemoryResourceRepository;
use super::repository::SharedResourceRepository;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeStorageBackend {
    Memory,
    Sqlite,
    Postgres,
}

impl RuntimeStorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl FromStr for RuntimeStorageBackend {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(LeaseError::Validation(format!(
                "unknown storage backend {other:?} (expected memory, sqlite or postgres)"
            ))),
        }
    }
}

impl fmt::Display for RuntimeStorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to open the resource store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeStorageConfig {
    pub backend: RuntimeStorageBackend,
    pub sqlite_path: String,
    pub postgres_url: Option<String>,
    pub postgres_schema: String,
}

impl Default for RuntimeStorageConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeStorageBackend::Sqlite,
            sqlite_path: "botfarm.db".to_string(),
            postgres_url: None,
            postgres_schema: "public".to_string(),
        }
    }
}

impl RuntimeStorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: RuntimeStorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Open the configured store. Backends compiled out of this build are
    /// reported as a validation error rather than silently replaced.
    pub fn open(&self) -> Result<SharedResourceRepository, LeaseError> {
        match self.backend {
            RuntimeStorageBackend::Memory => Ok(Arc::new(InMemoryResourceRepository::new())),
            RuntimeStorageBackend::Sqlite => self.open_sqlite(),
            RuntimeStorageBackend::Postgres => self.open_postgres(),
        }
    }

    #[cfg(feature = "sqlite-persistence")]
    fn open_sqlite(&self) -> Result<SharedResourceRepository, LeaseError> {
        let repo = super::sqlite_repository::SqliteResourceRepository::new(&self.sqlite_path)?;
        Ok(Arc::new(repo))
    }

    #[cfg(not(feature = "sqlite-persistence"))]
    fn open_sqlite(&self) -> Result<SharedResourceRepository, LeaseError> {
        Err(LeaseError::Validation(
            "sqlite backend requires the `sqlite-persistence` feature".to_string(),
        ))
    }

    #[cfg(feature = "kernel-postgres")]
    fn open_postgres(&self) -> Result<SharedResourceRepository, LeaseError> {
        let url = self.postgres_url.as_deref().ok_or_else(|| {
            LeaseError::Validation("postgres backend requires a database url".to_string())
        })?;
        if !super::postgres_repository::is_valid_schema_ident(&self.postgres_schema) {
            return Err(LeaseError::Validation(format!(
                "invalid postgres schema name {:?}",
                self.postgres_schema
            )));
        }
        let repo = super::postgres_repository::PostgresResourceRepository::new(url)
            .with_schema(self.postgres_schema.clone());
        Ok(Arc::new(repo))
    }

    #[cfg(not(feature = "kernel-postgres"))]
    fn open_postgres(&self) -> Result<SharedResourceRepository, LeaseError> {
        Err(LeaseError::Validation(
            "postgres backend requires the `kernel-postgres` feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse_case_insensitively() {
        assert_eq!(
            "SQLite".parse::<RuntimeStorageBackend>().unwrap(),
            RuntimeStorageBackend::Sqlite
        );
        assert_eq!(
            "postgresql".parse::<RuntimeStorageBackend>().unwrap(),
            RuntimeStorageBackend::Postgres
        );
        assert!("redis".parse::<RuntimeStorageBackend>().is_err());
    }

    #[test]
    fn memory_backend_opens_an_empty_store() {
        let repo = RuntimeStorageConfig::memory().open().expect("open memory");
        assert!(repo.list_resources().expect("list").is_empty());
        repo.ping().expect("ping");
    }

    #[cfg(feature = "sqlite-persistence")]
    #[test]
    fn sqlite_backend_opens_the_configured_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RuntimeStorageConfig {
            sqlite_path: dir.path().join("store.db").to_string_lossy().into_owned(),
            ..RuntimeStorageConfig::default()
        };
        let repo = config.open().expect("open sqlite");
        repo.ping().expect("ping");
        assert!(dir.path().join("store.db").exists());
    }

    #[cfg(feature = "kernel-postgres")]
    #[test]
    fn postgres_backend_requires_a_url() {
        let config = RuntimeStorageConfig {
            backend: RuntimeStorageBackend::Postgres,
            ..RuntimeStorageConfig::default()
        };
        assert!(matches!(config.open(), Err(LeaseError::Validation(_))));
    }
}

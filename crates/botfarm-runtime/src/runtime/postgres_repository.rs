//! Postgres-backed resource store.
//!
//! This module is feature-gated behind `kernel-postgres`. Calls are
//! synchronous: each one is driven to completion on a dedicated tokio runtime,
//! so callers inside an async server should go through `spawn_blocking`.

#![cfg(feature = "kernel-postgres")]

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{map_driver_err, LeaseError};
use crate::identity::ResourceId;

use super::models::{dt_to_ms, ms_to_dt, AcquireOutcome, ReleaseOutcome, ResourceRecord};
use super::repository::ResourceRepository;

const SELECT_COLUMNS: &str =
    "id, created_at_ms, login, password_hash, project_id, env, domain, lease_expiry_ms";

pub(crate) fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn new_db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("botfarm-store-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn row_to_record(row: &PgRow) -> Result<ResourceRecord, LeaseError> {
    let decode = |e: sqlx::Error| map_driver_err("decode resource row", e);
    let id: Uuid = row.try_get(0).map_err(decode)?;
    let created_at_ms: i64 = row.try_get(1).map_err(decode)?;
    let env: String = row.try_get(5).map_err(decode)?;
    let domain: String = row.try_get(6).map_err(decode)?;
    let lease_expiry_ms: Option<i64> = row.try_get(7).map_err(decode)?;
    Ok(ResourceRecord {
        id: ResourceId::from(id),
        created_at: ms_to_dt(created_at_ms)?,
        login: row.try_get(2).map_err(decode)?,
        password_hash: row.try_get(3).map_err(decode)?,
        project_id: row.try_get(4).map_err(decode)?,
        env: env.parse()?,
        domain: domain.parse()?,
        lease_expiry: lease_expiry_ms.map(ms_to_dt).transpose()?,
    })
}

#[derive(Clone)]
pub struct PostgresResourceRepository {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: Arc<OnceLock<Result<(), String>>>,
}

impl PostgresResourceRepository {
    /// Build a repository over a lazily-connected pool. Nothing touches the
    /// network until the first call.
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let db_runtime = new_db_runtime();
        // The pool spawns its maintenance task on whatever runtime is current.
        let _guard = db_runtime.as_ref().ok().map(|rt| rt.enter());
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&database_url);
        let (pool, init_error) = match (pool, &db_runtime) {
            (Ok(pool), Ok(_)) => (Some(pool), None),
            (Err(e), _) => (None, Some(format!("failed to initialize postgres pool: {e}"))),
            (_, Err(e)) => (None, Some(format!("failed to build db runtime: {e}"))),
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime: db_runtime.ok(),
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.schema_ready = Arc::new(OnceLock::new());
        self
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, LeaseError> {
        if let Some(err) = &self.init_error {
            return Err(map_driver_err("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| map_driver_err("runtime not available", "no db runtime"))
    }

    fn pool(&self) -> Result<&PgPool, LeaseError> {
        self.pool
            .as_ref()
            .ok_or_else(|| map_driver_err("pool not available", "no postgres pool"))
    }

    fn table(&self) -> String {
        format!("\"{}\".resources", self.schema)
    }

    fn ensure_schema(&self) -> Result<(), LeaseError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }

        let result = self.schema_ready.get_or_init(|| {
            let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema);
            let sql_resources = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    created_at_ms BIGINT NOT NULL,
                    login TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    project_id UUID NOT NULL,
                    env TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    lease_expiry_ms BIGINT NULL,
                    CONSTRAINT resources_login_key UNIQUE (login)
                )",
                self.table()
            );
            let sql_allocation_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_resources_allocation
                 ON {}(lease_expiry_ms, created_at_ms, id)",
                self.table()
            );

            let pool = match self.pool() {
                Ok(p) => p.clone(),
                Err(e) => return Err(e.to_string()),
            };
            let rt = match self.runtime() {
                Ok(r) => r,
                Err(e) => return Err(e.to_string()),
            };

            rt.block_on(async {
                sqlx::query(&sql_schema).execute(&pool).await?;
                sqlx::query(&sql_resources).execute(&pool).await?;
                sqlx::query(&sql_allocation_idx).execute(&pool).await?;
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| e.to_string())
        });

        result
            .clone()
            .map_err(|e| map_driver_err("schema bootstrap", e))
    }

    fn fetch_records(
        &self,
        sql: String,
        limit: Option<i64>,
    ) -> Result<Vec<ResourceRecord>, LeaseError> {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;

        rt.block_on(async move {
            let mut query = sqlx::query(&sql);
            if let Some(limit) = limit {
                query = query.bind(limit);
            }
            let rows = query
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("query resources", e))?;
            rows.iter().map(row_to_record).collect()
        })
    }

    fn fetch_one_by<T>(&self, column: &str, value: T) -> Result<Option<ResourceRecord>, LeaseError>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE {column} = $1",
            self.table()
        );

        rt.block_on(async move {
            let row = sqlx::query(&sql)
                .bind(value)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("get resource", e))?;
            row.as_ref().map(row_to_record).transpose()
        })
    }
}

impl ResourceRepository for PostgresResourceRepository {
    fn insert_resource(&self, record: &ResourceRecord) -> Result<(), LeaseError> {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "INSERT INTO {}
             (id, created_at_ms, login, password_hash, project_id, env, domain, lease_expiry_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.table()
        );
        let record = record.clone();

        rt.block_on(async move {
            match sqlx::query(&sql)
                .bind(*record.id.as_uuid())
                .bind(dt_to_ms(record.created_at))
                .bind(&record.login)
                .bind(&record.password_hash)
                .bind(record.project_id)
                .bind(record.env.as_str())
                .bind(record.domain.as_str())
                .bind(record.lease_expiry.map(dt_to_ms))
                .execute(&pool)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e, "resources_login_key") => {
                    Err(LeaseError::DuplicateLogin(record.login.clone()))
                }
                Err(e) => Err(map_driver_err("insert resource", e)),
            }
        })
    }

    fn get_resource(&self, id: &ResourceId) -> Result<Option<ResourceRecord>, LeaseError> {
        self.fetch_one_by("id", *id.as_uuid())
    }

    fn find_by_login(&self, login: &str) -> Result<Option<ResourceRecord>, LeaseError> {
        self.fetch_one_by("login", login.to_string())
    }

    fn list_resources(&self) -> Result<Vec<ResourceRecord>, LeaseError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} ORDER BY created_at_ms DESC, id DESC",
            self.table()
        );
        self.fetch_records(sql, None)
    }

    fn list_free_resources(&self, limit: usize) -> Result<Vec<ResourceRecord>, LeaseError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {}
             WHERE lease_expiry_ms IS NULL
             ORDER BY created_at_ms ASC, id ASC
             LIMIT $1",
            self.table()
        );
        self.fetch_records(sql, Some(i64::try_from(limit).unwrap_or(i64::MAX)))
    }

    fn try_acquire(
        &self,
        id: &ResourceId,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, LeaseError> {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let update_sql = format!(
            "UPDATE {} SET lease_expiry_ms = $2
             WHERE id = $1 AND lease_expiry_ms IS NULL
             RETURNING {SELECT_COLUMNS}",
            self.table()
        );
        let exists_sql = format!("SELECT 1 FROM {} WHERE id = $1", self.table());
        let id = *id.as_uuid();
        let now_ms = dt_to_ms(now);

        rt.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_driver_err("begin acquire tx", e))?;

            let leased = sqlx::query(&update_sql)
                .bind(id)
                .bind(now_ms)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_driver_err("acquire lease", e))?;

            let outcome = match leased {
                Some(row) => AcquireOutcome::Acquired(row_to_record(&row)?),
                None => {
                    let exists = sqlx::query(&exists_sql)
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| map_driver_err("check resource exists", e))?;
                    if exists.is_some() {
                        AcquireOutcome::AlreadyLocked
                    } else {
                        AcquireOutcome::Missing
                    }
                }
            };

            tx.commit()
                .await
                .map_err(|e| map_driver_err("commit acquire tx", e))?;
            Ok(outcome)
        })
    }

    fn release(&self, id: &ResourceId) -> Result<ReleaseOutcome, LeaseError> {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let update_sql = format!(
            "UPDATE {} SET lease_expiry_ms = NULL
             WHERE id = $1 AND lease_expiry_ms IS NOT NULL
             RETURNING {SELECT_COLUMNS}",
            self.table()
        );
        let select_sql = format!("SELECT {SELECT_COLUMNS} FROM {} WHERE id = $1", self.table());
        let id = *id.as_uuid();

        rt.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_driver_err("begin release tx", e))?;

            let released = sqlx::query(&update_sql)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_driver_err("release lease", e))?;

            let outcome = match released {
                Some(row) => ReleaseOutcome::Released(row_to_record(&row)?),
                None => {
                    let current = sqlx::query(&select_sql)
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| map_driver_err("select resource", e))?;
                    match current {
                        Some(row) => ReleaseOutcome::NotLocked(row_to_record(&row)?),
                        None => ReleaseOutcome::Missing,
                    }
                }
            };

            tx.commit()
                .await
                .map_err(|e| map_driver_err("commit release tx", e))?;
            Ok(outcome)
        })
    }

    fn clear_stale_leases(&self, stale_at: DateTime<Utc>) -> Result<u64, LeaseError> {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "UPDATE {} SET lease_expiry_ms = NULL
             WHERE lease_expiry_ms IS NOT NULL AND lease_expiry_ms <= $1",
            self.table()
        );
        let stale_at_ms = dt_to_ms(stale_at);

        rt.block_on(async move {
            let cleared = sqlx::query(&sql)
                .bind(stale_at_ms)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("clear stale leases", e))?
                .rows_affected();
            Ok(cleared)
        })
    }

    fn acquire_oldest_free(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceRecord>, LeaseError> {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        // SKIP LOCKED lets concurrent callers fan out over different rows
        // instead of queueing on the same oldest one.
        let sql = format!(
            "UPDATE {table} SET lease_expiry_ms = $1
             WHERE id = (
                 SELECT id FROM {table}
                 WHERE lease_expiry_ms IS NULL
                 ORDER BY created_at_ms ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {SELECT_COLUMNS}",
            table = self.table()
        );
        let now_ms = dt_to_ms(now);

        rt.block_on(async move {
            let row = sqlx::query(&sql)
                .bind(now_ms)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("acquire oldest free", e))?;
            row.as_ref().map(row_to_record).transpose()
        })
    }

    fn ping(&self) -> Result<(), LeaseError> {
        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        rt.block_on(async move {
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map(|_| ())
                .map_err(|e| map_driver_err("ping", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::{Duration, TimeZone, Utc};

    use super::{is_valid_schema_ident, PostgresResourceRepository};
    use crate::runtime::repository::ResourceRepository;
    use crate::runtime::test_support::{assert_repository_contract, seed_resource};

    fn test_db_url() -> Option<String> {
        std::env::var("BOTFARM_TEST_POSTGRES_URL").ok()
    }

    fn test_schema() -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("botfarm_repo_test_{}", ts)
    }

    #[test]
    fn schema_identifiers_are_restricted() {
        assert!(is_valid_schema_ident("botfarm_1"));
        assert!(!is_valid_schema_ident(""));
        assert!(!is_valid_schema_ident("public\"; DROP TABLE x; --"));
    }

    #[test]
    fn invalid_schema_is_rejected_before_any_query() {
        let repo = PostgresResourceRepository::new("postgres://localhost/botfarm")
            .with_schema("bad-schema");
        assert!(repo.list_resources().is_err());
    }

    #[test]
    fn runtime_repository_contract_postgres_when_env_is_set() {
        let Some(db_url) = test_db_url() else {
            return;
        };
        let repo = PostgresResourceRepository::new(db_url.clone()).with_schema(test_schema());
        assert_repository_contract(&repo);

        const CALLERS: usize = 8;
        const FREE_ROWS: usize = 3;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let schema = format!("{}_pool", test_schema());
        let seeded = PostgresResourceRepository::new(db_url.clone()).with_schema(schema.clone());
        let seeded_ids: HashSet<_> = (0..FREE_ROWS as i64)
            .map(|i| {
                let login = format!("bot{i}@example.com");
                seed_resource(&seeded, &login, t0 + Duration::seconds(i))
            })
            .collect();

        // One pool per caller so every acquire runs on its own connection.
        let barrier = Arc::new(Barrier::new(CALLERS));
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let repo =
                    PostgresResourceRepository::new(db_url.clone()).with_schema(schema.clone());
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    repo.list_free_resources(1).expect("warm up pool");
                    barrier.wait();
                    repo.acquire_oldest_free(t0 + Duration::minutes(1))
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().expect("acquire_oldest_free"))
            .collect();

        let won: Vec<_> = results.iter().flatten().map(|r| r.id).collect();
        let distinct: HashSet<_> = won.iter().copied().collect();
        assert_eq!(won.len(), FREE_ROWS);
        assert_eq!(distinct, seeded_ids);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), CALLERS - FREE_ROWS);
    }
}

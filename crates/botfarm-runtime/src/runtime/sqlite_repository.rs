//! SQLite-backed resource store.
//!
//! Every lease transition runs inside a `BEGIN IMMEDIATE` transaction, so
//! writers from other connections or processes on the same database file are
//! serialized by SQLite's write lock.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::error::{map_driver_err, LeaseError};
use crate::identity::ResourceId;

use super::models::{dt_to_ms, ms_to_dt, AcquireOutcome, ReleaseOutcome, ResourceRecord};
use super::repository::ResourceRepository;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str =
    "id, created_at_ms, login, password_hash, project_id, env, domain, lease_expiry_ms";

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ResourceRecord> {
    let id: String = row.get(0)?;
    let created_at_ms: i64 = row.get(1)?;
    let project_id: String = row.get(4)?;
    let env: String = row.get(5)?;
    let domain: String = row.get(6)?;
    let lease_expiry_ms: Option<i64> = row.get(7)?;
    Ok(ResourceRecord {
        id: id.parse().map_err(|e| conversion_err(0, e))?,
        created_at: ms_to_dt(created_at_ms).map_err(|e| conversion_err(1, e))?,
        login: row.get(2)?,
        password_hash: row.get(3)?,
        project_id: project_id.parse().map_err(|e| conversion_err(4, e))?,
        env: env.parse().map_err(|e| conversion_err(5, e))?,
        domain: domain.parse().map_err(|e| conversion_err(6, e))?,
        lease_expiry: lease_expiry_ms
            .map(ms_to_dt)
            .transpose()
            .map_err(|e| conversion_err(7, e))?,
    })
}

fn is_unique_login_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && msg.as_deref().is_some_and(|m| m.contains("login"))
        }
        _ => false,
    }
}

fn select_by_id(
    tx: &Transaction<'_>,
    id: &ResourceId,
) -> Result<Option<ResourceRecord>, LeaseError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM resources WHERE id = ?1");
    tx.query_row(&sql, params![id.to_string()], row_to_record)
        .optional()
        .map_err(|e| map_driver_err("select resource", e))
}

pub struct SqliteResourceRepository {
    conn: Mutex<Connection>,
}

impl SqliteResourceRepository {
    /// Open (or create) the database at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub fn new(path: &str) -> Result<Self, LeaseError> {
        let conn = Connection::open(path).map_err(|e| map_driver_err("open sqlite", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| map_driver_err("set busy timeout", e))?;
        if path != ":memory:" {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                .map_err(|e| map_driver_err("enable wal", e))?;
        }
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<(), LeaseError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                created_at_ms INTEGER NOT NULL,
                login TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                project_id TEXT NOT NULL,
                env TEXT NOT NULL,
                domain TEXT NOT NULL,
                lease_expiry_ms INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_resources_allocation
                ON resources(lease_expiry_ms, created_at_ms, id);",
        )
        .map_err(|e| map_driver_err("schema bootstrap", e))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LeaseError> {
        self.conn
            .lock()
            .map_err(|e| map_driver_err("sqlite connection poisoned", e))
    }

    fn query_records(
        &self,
        sql: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ResourceRecord>, LeaseError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| map_driver_err("prepare query", e))?;
        let rows = match limit {
            Some(limit) => stmt.query_map(params![limit], row_to_record),
            None => stmt.query_map([], row_to_record),
        }
        .map_err(|e| map_driver_err("query resources", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("decode resources", e))
    }
}

impl ResourceRepository for SqliteResourceRepository {
    fn insert_resource(&self, record: &ResourceRecord) -> Result<(), LeaseError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO resources
             (id, created_at_ms, login, password_hash, project_id, env, domain, lease_expiry_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                dt_to_ms(record.created_at),
                record.login,
                record.password_hash,
                record.project_id.to_string(),
                record.env.as_str(),
                record.domain.as_str(),
                record.lease_expiry.map(dt_to_ms),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_login_violation(&e) => {
                Err(LeaseError::DuplicateLogin(record.login.clone()))
            }
            Err(e) => Err(map_driver_err("insert resource", e)),
        }
    }

    fn get_resource(&self, id: &ResourceId) -> Result<Option<ResourceRecord>, LeaseError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM resources WHERE id = ?1");
        conn.query_row(&sql, params![id.to_string()], row_to_record)
            .optional()
            .map_err(|e| map_driver_err("get resource", e))
    }

    fn find_by_login(&self, login: &str) -> Result<Option<ResourceRecord>, LeaseError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM resources WHERE login = ?1");
        conn.query_row(&sql, params![login], row_to_record)
            .optional()
            .map_err(|e| map_driver_err("find resource by login", e))
    }

    fn list_resources(&self) -> Result<Vec<ResourceRecord>, LeaseError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM resources ORDER BY created_at_ms DESC, id DESC"
        );
        self.query_records(&sql, None)
    }

    fn list_free_resources(&self, limit: usize) -> Result<Vec<ResourceRecord>, LeaseError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM resources
             WHERE lease_expiry_ms IS NULL
             ORDER BY created_at_ms ASC, id ASC
             LIMIT ?1"
        );
        self.query_records(&sql, Some(i64::try_from(limit).unwrap_or(i64::MAX)))
    }

    fn try_acquire(
        &self,
        id: &ResourceId,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, LeaseError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_driver_err("begin acquire tx", e))?;

        let updated = tx
            .execute(
                "UPDATE resources SET lease_expiry_ms = ?2
                 WHERE id = ?1 AND lease_expiry_ms IS NULL",
                params![id.to_string(), dt_to_ms(now)],
            )
            .map_err(|e| map_driver_err("acquire lease", e))?;

        let outcome = match (updated, select_by_id(&tx, id)?) {
            (1, Some(row)) => AcquireOutcome::Acquired(row),
            (_, Some(_)) => AcquireOutcome::AlreadyLocked,
            (_, None) => AcquireOutcome::Missing,
        };

        tx.commit()
            .map_err(|e| map_driver_err("commit acquire tx", e))?;
        Ok(outcome)
    }

    fn release(&self, id: &ResourceId) -> Result<ReleaseOutcome, LeaseError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_driver_err("begin release tx", e))?;

        let updated = tx
            .execute(
                "UPDATE resources SET lease_expiry_ms = NULL
                 WHERE id = ?1 AND lease_expiry_ms IS NOT NULL",
                params![id.to_string()],
            )
            .map_err(|e| map_driver_err("release lease", e))?;

        let outcome = match (updated, select_by_id(&tx, id)?) {
            (1, Some(row)) => ReleaseOutcome::Released(row),
            (_, Some(row)) => ReleaseOutcome::NotLocked(row),
            (_, None) => ReleaseOutcome::Missing,
        };

        tx.commit()
            .map_err(|e| map_driver_err("commit release tx", e))?;
        Ok(outcome)
    }

    fn clear_stale_leases(&self, stale_at: DateTime<Utc>) -> Result<u64, LeaseError> {
        let conn = self.conn()?;
        let cleared = conn
            .execute(
                "UPDATE resources SET lease_expiry_ms = NULL
                 WHERE lease_expiry_ms IS NOT NULL AND lease_expiry_ms <= ?1",
                params![dt_to_ms(stale_at)],
            )
            .map_err(|e| map_driver_err("clear stale leases", e))?;
        Ok(cleared as u64)
    }

    fn acquire_oldest_free(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ResourceRecord>, LeaseError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_driver_err("begin acquire-free tx", e))?;

        let sql = format!(
            "UPDATE resources SET lease_expiry_ms = ?1
             WHERE id = (
                 SELECT id FROM resources
                 WHERE lease_expiry_ms IS NULL
                 ORDER BY created_at_ms ASC, id ASC
                 LIMIT 1
             )
             RETURNING {SELECT_COLUMNS}"
        );
        let leased = tx
            .query_row(&sql, params![dt_to_ms(now)], row_to_record)
            .optional()
            .map_err(|e| map_driver_err("acquire oldest free", e))?;

        tx.commit()
            .map_err(|e| map_driver_err("commit acquire-free tx", e))?;
        Ok(leased)
    }

    fn ping(&self) -> Result<(), LeaseError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| map_driver_err("ping", e))
    }
}

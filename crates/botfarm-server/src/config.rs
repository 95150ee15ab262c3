use std::fmt;
use std::time::Duration;

use anyhow::bail;
use botfarm_runtime::runtime::{
    LeaseConfig, RuntimeStorageBackend, RuntimeStorageConfig, DEFAULT_LOCK_TIMEOUT_SECONDS,
};
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Runtime configuration for the `botfarm-server` binary.
///
/// Every value can come from a flag or the matching environment variable;
/// a `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "botfarm-server",
    version,
    about = "Leases bot accounts from a shared pool over HTTP",
    args_override_self = true
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("127.0.0.1:8080"))]
    pub server_addr: String,

    /// Resource store: `memory`, `sqlite` or `postgres`.
    ///
    /// Environment variable: `STORAGE_BACKEND`
    #[arg(long, env = "STORAGE_BACKEND", default_value_t = String::from("sqlite"))]
    pub storage_backend: String,

    /// SQLite database file.
    ///
    /// Environment variable: `SQLITE_PATH`
    #[arg(long, env = "SQLITE_PATH", default_value_t = String::from("botfarm.db"))]
    pub sqlite_path: String,

    /// Postgres connection string, required for the `postgres` backend.
    ///
    /// Environment variable: `DATABASE_URL`
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Postgres schema holding the `resources` table.
    ///
    /// Environment variable: `DATABASE_SCHEMA`
    #[arg(long, env = "DATABASE_SCHEMA", default_value_t = String::from("public"))]
    pub database_schema: String,

    /// Seconds after which an unreleased lease is reaped.
    ///
    /// Environment variable: `LOCK_TIMEOUT_SECONDS`
    #[arg(long, env = "LOCK_TIMEOUT_SECONDS", default_value_t = DEFAULT_LOCK_TIMEOUT_SECONDS)]
    pub lock_timeout_seconds: i64,

    /// Period of the background reaper. `0` disables it; allocation still
    /// reaps on every call.
    ///
    /// Environment variable: `REAP_INTERVAL_SECONDS`
    #[arg(long, env = "REAP_INTERVAL_SECONDS", default_value_t = 0)]
    pub reap_interval_seconds: u64,

    /// Key used to sign bearer tokens.
    ///
    /// Environment variable: `AUTH_SECRET`
    #[arg(long, env = "AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: String,

    /// Lifetime of issued bearer tokens.
    ///
    /// Environment variable: `ACCESS_TOKEN_EXPIRE_MINUTES`
    #[arg(long, env = "ACCESS_TOKEN_EXPIRE_MINUTES", default_value_t = 60)]
    pub access_token_expire_minutes: i64,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Ten years, in seconds. Larger lock timeouts are rejected at startup.
pub const MAX_LOCK_TIMEOUT_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Ten years, in minutes. Larger token lifetimes are rejected at startup.
pub const MAX_ACCESS_TOKEN_EXPIRE_MINUTES: i64 = 10 * 365 * 24 * 60;

#[derive(Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub storage: RuntimeStorageConfig,
    pub lease: LeaseConfig,
    pub reap_interval: Option<Duration>,
    pub auth_secret: String,
    pub token_ttl: chrono::Duration,
    pub log_format: LogFormat,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_addr", &self.server_addr)
            .field("storage", &self.storage.backend)
            .field("lease", &self.lease)
            .field("reap_interval", &self.reap_interval)
            .field("token_ttl", &self.token_ttl)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if !(1..=MAX_LOCK_TIMEOUT_SECONDS).contains(&args.lock_timeout_seconds) {
            bail!("LOCK_TIMEOUT_SECONDS must be between 1 and {MAX_LOCK_TIMEOUT_SECONDS}");
        }
        let max_ttl = MAX_ACCESS_TOKEN_EXPIRE_MINUTES;
        if !(1..=max_ttl).contains(&args.access_token_expire_minutes) {
            bail!("ACCESS_TOKEN_EXPIRE_MINUTES must be between 1 and {max_ttl}");
        }
        if args.auth_secret.trim().is_empty() {
            bail!("AUTH_SECRET must not be empty");
        }

        let backend: RuntimeStorageBackend = args.storage_backend.parse()?;
        if backend == RuntimeStorageBackend::Postgres && args.database_url.is_none() {
            bail!("DATABASE_URL is required when STORAGE_BACKEND=postgres");
        }

        let lease = LeaseConfig::from_seconds(args.lock_timeout_seconds)?;
        let token_ttl = chrono::Duration::try_minutes(args.access_token_expire_minutes)
            .ok_or_else(|| anyhow::anyhow!("ACCESS_TOKEN_EXPIRE_MINUTES is out of range"))?;

        Ok(Self {
            server_addr: args.server_addr,
            storage: RuntimeStorageConfig {
                backend,
                sqlite_path: args.sqlite_path,
                postgres_url: args.database_url,
                postgres_schema: args.database_schema,
            },
            lease,
            reap_interval: (args.reap_interval_seconds > 0)
                .then(|| Duration::from_secs(args.reap_interval_seconds)),
            auth_secret: args.auth_secret,
            token_ttl,
            log_format: args.log_format,
        })
    }
}

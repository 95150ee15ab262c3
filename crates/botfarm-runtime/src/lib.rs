//! Lease allocation engine for a shared pool of bot accounts.
//!
//! A caller asks for a free account, leases it, uses it, and releases it.
//! Leases that are never released are cleared by the reaper once they are
//! older than the configured lock timeout. All coordination goes through the
//! resource store, so several service processes can share one database.
//!
//! Storage backends are selected with features: `sqlite-persistence` and
//! `kernel-postgres`. The axum router lives behind `execution-server`.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod auth;
pub mod clock;
pub mod directory;
pub mod error;
pub mod identity;
pub mod runtime;
pub mod security;

pub use auth::{AccessToken, AuthGate};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use directory::{DirectoryService, NewResource};
pub use error::LeaseError;
pub use identity::ResourceId;
pub use security::{PasswordHasher, TokenSigner};

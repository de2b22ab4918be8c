//! Database provisioning and migration infrastructure.
//!
//! Everything here takes an explicit connection handle; nothing opens an
//! ambient connection of its own. The CLI layer supplies a
//! [`ConnectionSpec`] and a migrations directory, and calls the operations
//! in [`ops`].

pub mod conn;
pub mod error;
pub mod locking;
pub mod ops;
pub mod provision;
pub mod runner;
pub mod tracker;

pub use conn::{connect_catalog, connect_target, ConnectionSpec};
pub use error::DbInfraError;
pub use ops::{apply_all, ensure_database, ensure_roles, list_pending, list_rollback_candidates, prepare, rollback};
pub use provision::{RolePasswords, RoleSet};
pub use runner::{AppliedStep, MigrationRunner};

//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the collections store.
//! - Apply schema migrations in deterministic order.
//! - Define the storage-layer error type shared by every store implementation.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - No collection data is read or written before migrations succeed.

use thiserror::Error;
use uuid::Uuid;

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory, open_store};

pub type DbResult<T> = Result<T, DbError>;

/// Storage-layer failure. Always propagated to repository callers unchanged.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    #[error("collection not found: {0}")]
    NotFound(String),
    #[error("transaction {0} is already finished")]
    TransactionClosed(Uuid),
    #[error("transaction state lock poisoned")]
    LockPoisoned,
    #[error("shared connection still held by a transaction after {waited_ms}ms")]
    ConnectionBusy { waited_ms: u64 },
}

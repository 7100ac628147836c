//! Collections schema migrations.
//!
//! # Responsibility
//! - Describe how the `collections` and `collections_posts` tables evolve.
//! - Bring any older database file up to the layout the store reads.
//!
//! # Invariants
//! - Versions are contiguous from 1 and mirrored to `PRAGMA user_version`.
//! - All pending steps run in one transaction: a failed step leaves the file
//!   at its previous version.
//! - A file stamped with a version newer than [`latest_version`] is refused,
//!   never downgraded.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

/// One schema step, embedded at compile time.
#[derive(Debug, Clone, Copy)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    // Collections plus their membership rows; memberships cascade on delete
    // and a post appears at most once per collection.
    SchemaStep {
        version: 1,
        name: "collections",
        sql: include_str!("0001_collections.sql"),
    },
    // Explicit membership ordinal. Rows written before this step all read
    // as position 0 and fall back to insertion order.
    SchemaStep {
        version: 2,
        name: "collection_post_order",
        sql: include_str!("0002_collection_post_order.sql"),
    },
];

/// Schema version written by the newest step this build knows.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Upgrades the collections schema on `conn` to [`latest_version`].
///
/// # Errors
/// - [`DbError::UnsupportedSchemaVersion`] when the file is newer than this build.
/// - Any SQLite error raised by a step; the upgrade is rolled back as a whole.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = schema_version(conn)?;
    let to = latest_version();

    if from > to {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: to,
        });
    }
    if from == to {
        debug!("event=db_migrate module=db status=skip version={from}");
        return Ok(());
    }

    info!("event=db_migrate module=db status=start from={from} to={to}");
    let tx = conn.transaction()?;
    for step in SCHEMA_STEPS.iter().skip_while(|step| step.version <= from) {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        info!(
            "event=db_migrate module=db status=ok version={} name={}",
            step.version, step.name
        );
    }
    tx.commit()?;

    Ok(())
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

//! Database module for offerings, subjects and subscriptions

mod offerings;
mod subscriptions;
mod types;

pub use offerings::OfferingStore;
pub use subscriptions::SubscriptionStore;
pub use types::{DbOffering, OfferingRow, OfferingView, UpsertOutcome};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};

/// Opens a SQLite file (creating it if needed) and applies `schema`.
fn open_with_schema(db_path: &Path, schema: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    init_schema(conn, schema)
}

fn open_memory_with_schema(schema: &str) -> Result<Connection> {
    init_schema(Connection::open_in_memory()?, schema)
}

fn init_schema(conn: Connection, schema: &str) -> Result<Connection> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(schema)?;
    debug!("Database schema initialized");
    Ok(conn)
}

/// Acquires a store's connection. Each store operation holds the guard for
/// exactly one logical transaction.
fn lock(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock().map_err(|_| Error::poisoned())
}

//! Error types shared by the scrape, store and notification layers.

use thiserror::Error;

use crate::types::SubscriberId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while harvesting, storing or delivering.
///
/// Row-level (`MalformedRecord`) and notification-level (`DeliveryFailure`)
/// errors are handled where they occur. Only `HarvestFailure` and `Storage`
/// end a scrape cycle, and neither ends the process.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// A single harvested row could not be turned into an offering
    #[error("Malformed record: {reason}")]
    MalformedRecord { reason: String },

    /// The harvester could not produce a snapshot
    #[error("Harvest failed: {message}")]
    HarvestFailure { message: String },

    /// A write raced on a unique key and the retry also failed
    #[error("Write conflict on {entity}: {message}")]
    StoreWriteConflict { entity: &'static str, message: String },

    /// The database is corrupt, locked or unreachable
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// A notification could not be delivered to a subscriber
    #[error("Delivery to {subscriber} failed: {message}")]
    DeliveryFailure {
        subscriber: SubscriberId,
        message: String,
    },

    /// Caller input was rejected before reaching a store
    #[error("Invalid input {input:?}: {message}")]
    ValidationError { input: String, message: String },

    /// The chat service could not be reached while polling for commands
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Returns true if this error discards the whole scrape cycle.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(
            self,
            Error::HarvestFailure { .. } | Error::Storage { .. } | Error::StoreWriteConflict { .. }
        )
    }

    /// Returns true if the error came from the database layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::StoreWriteConflict { .. })
    }

    pub(crate) fn harvest(message: impl Into<String>) -> Self {
        Error::HarvestFailure {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub(crate) fn poisoned() -> Self {
        Error::Storage {
            message: "database lock poisoned by a panicked writer".to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage {
            message: err.to_string(),
        }
    }
}

/// Returns true if the SQLite error is a UNIQUE/PRIMARY KEY violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

/// Returns true if a write lost a race with another writer: a unique-key
/// violation, or the database stayed locked past the busy timeout.
pub(crate) fn is_write_conflict(err: &rusqlite::Error) -> bool {
    if is_unique_violation(err) {
        return true;
    }
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

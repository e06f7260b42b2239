//! Durable store for subjects and their offerings.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::warn;

use super::types::{DbOffering, UpsertOutcome};
use super::{lock, open_memory_with_schema, open_with_schema};
use crate::error::{is_write_conflict, Error, Result};
use crate::types::{CourseOffering, Subject};

const SCHEMA_SQL: &str = include_str!("../../../../sql/init_offerings.sql");

const SELECT_JOINED: &str = "
    SELECT o.offering_id, s.code, s.name, o.section_number, o.term_label, o.instructor,
           o.schedule, o.offered_seats, o.occupied_seats, o.available_seats, o.location,
           o.last_seen_at
    FROM offerings o
    JOIN subjects s ON s.code = o.subject_code";

const ORDER_BY: &str = "ORDER BY s.code, o.term_label, o.section_number, o.offering_id";

pub struct OfferingStore {
    db: Mutex<Connection>,
}

impl OfferingStore {
    /// Opens (or creates) the offerings database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_with_schema(db_path.as_ref(), SCHEMA_SQL)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(open_memory_with_schema(SCHEMA_SQL)?),
        })
    }

    /// Creates the subject if its code is new; otherwise keeps the last seen
    /// non-empty name. Returns true if the subject was created.
    pub fn upsert_subject(&self, subject: &Subject) -> Result<bool> {
        let db = lock(&self.db)?;
        let existed: bool = db
            .query_row(
                "SELECT 1 FROM subjects WHERE code = ?1",
                [&subject.code],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        db.execute(
            "INSERT INTO subjects (code, name, created_at, updated_at)
             VALUES (?1, ?2, datetime('now'), datetime('now'))
             ON CONFLICT(code) DO UPDATE SET
                name = excluded.name,
                updated_at = excluded.updated_at
             WHERE excluded.name <> '' AND excluded.name <> subjects.name",
            (&subject.code, &subject.name),
        )?;

        Ok(!existed)
    }

    /// Inserts the offering, or updates its seat counts and location if an
    /// offering with the same identity key already exists.
    pub fn upsert(&self, offering: &CourseOffering) -> Result<UpsertOutcome> {
        let mut db = lock(&self.db)?;

        match upsert_in(&mut db, offering) {
            Err(e) if is_write_conflict(&e) => {
                // Another connection held the write lock or inserted the same
                // identity key first. Re-read and update instead.
                warn!(
                    subject = %offering.subject_code,
                    section = %offering.section_number,
                    error = %e,
                    "Write conflict on offering, retrying"
                );
                upsert_in(&mut db, offering).map_err(|e| {
                    if is_write_conflict(&e) {
                        Error::StoreWriteConflict {
                            entity: "offering",
                            message: e.to_string(),
                        }
                    } else {
                        e.into()
                    }
                })
            }
            other => other.map_err(Error::from),
        }
    }

    /// All offerings joined with their subject.
    pub fn query_all(&self) -> Result<Vec<DbOffering>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(&format!("{SELECT_JOINED} {ORDER_BY}"))?;
        let rows = stmt.query_map([], offering_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Offerings with at least `min` available seats.
    pub fn query_by_availability(&self, min: u32) -> Result<Vec<DbOffering>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(&format!(
            "{SELECT_JOINED} WHERE o.available_seats >= ?1 {ORDER_BY}"
        ))?;
        let rows = stmt.query_map([min], offering_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Offerings of one subject.
    pub fn query_by_code(&self, subject_code: &str) -> Result<Vec<DbOffering>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(&format!("{SELECT_JOINED} WHERE s.code = ?1 {ORDER_BY}"))?;
        let rows = stmt.query_map([subject_code], offering_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Number of stored offerings.
    pub fn count(&self) -> Result<u64> {
        let db = lock(&self.db)?;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM offerings", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

/// One upsert as a single transaction. The write lock is taken up front so
/// the lookup and the insert see the same state.
fn upsert_in(conn: &mut Connection, o: &CourseOffering) -> rusqlite::Result<UpsertOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<(i64, u32)> = tx
        .query_row(
            "SELECT offering_id, available_seats FROM offerings
             WHERE subject_code = ?1 AND section_number = ?2 AND term_label = ?3
               AND instructor = ?4 AND schedule = ?5",
            params![
                o.subject_code,
                o.section_number,
                o.term_label,
                o.instructor,
                o.schedule
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let outcome = match existing {
        Some((offering_id, previous_available)) => {
            tx.execute(
                "UPDATE offerings
                 SET offered_seats = ?1, occupied_seats = ?2, location = ?3,
                     last_seen_at = datetime('now')
                 WHERE offering_id = ?4",
                params![o.offered_seats, o.occupied_seats, o.location, offering_id],
            )?;
            UpsertOutcome::Updated {
                offering_id,
                previous_available,
                new_available: o.available_seats(),
            }
        }
        None => {
            tx.execute(
                "INSERT INTO offerings (
                    subject_code, section_number, term_label, instructor, schedule,
                    offered_seats, occupied_seats, location, first_seen_at, last_seen_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'), datetime('now'))",
                params![
                    o.subject_code,
                    o.section_number,
                    o.term_label,
                    o.instructor,
                    o.schedule,
                    o.offered_seats,
                    o.occupied_seats,
                    o.location
                ],
            )?;
            UpsertOutcome::Created {
                offering_id: tx.last_insert_rowid(),
                available: o.available_seats(),
            }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

fn offering_from_row(row: &Row<'_>) -> rusqlite::Result<DbOffering> {
    let subject = Subject {
        code: row.get(1)?,
        name: row.get(2)?,
    };
    let offering = CourseOffering {
        subject_code: subject.code.clone(),
        subject_name: subject.name.clone(),
        section_number: row.get(3)?,
        term_label: row.get(4)?,
        instructor: row.get(5)?,
        schedule: row.get(6)?,
        offered_seats: row.get(7)?,
        occupied_seats: row.get(8)?,
        location: row.get(10)?,
    };

    Ok(DbOffering {
        offering_id: row.get(0)?,
        subject,
        offering,
        available_seats: row.get(9)?,
        last_seen_at: row.get(11)?,
    })
}

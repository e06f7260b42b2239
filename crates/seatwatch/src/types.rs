//! Domain types shared between the harvester, stores and dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Opaque subscriber identity (a Telegram chat id in practice).
pub type SubscriberId = i64;

/// One harvested row before normalization, keyed by the names in [`fields`].
pub type RawRecord = HashMap<String, String>;

/// Canonical keys of a [`RawRecord`].
pub mod fields {
    pub const SUBJECT_CODE: &str = "subject_code";
    pub const SUBJECT_NAME: &str = "subject_name";
    pub const SECTION: &str = "section";
    pub const TERM: &str = "term";
    pub const INSTRUCTOR: &str = "instructor";
    pub const SCHEDULE: &str = "schedule";
    pub const OFFERED: &str = "offered_seats";
    pub const OCCUPIED: &str = "occupied_seats";
    /// Reported by some portals; never trusted, always recomputed.
    pub const AVAILABLE: &str = "available_seats";
    pub const LOCATION: &str = "location";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub code: String,
    pub name: String,
}

/// The tuple that identifies an offering across scrape cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub subject_code: String,
    pub section_number: String,
    pub term_label: String,
    pub instructor: String,
    pub schedule: String,
}

/// One scheduled section of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseOffering {
    pub subject_code: String,
    /// Carried from the harvested row so the subject row can be upserted.
    pub subject_name: String,
    pub section_number: String,
    pub term_label: String,
    pub instructor: String,
    pub schedule: String,
    pub offered_seats: u32,
    pub occupied_seats: u32,
    pub location: String,
}

impl CourseOffering {
    /// Seats left, derived from offered and occupied. Overbooked sections
    /// report zero.
    pub fn available_seats(&self) -> u32 {
        self.offered_seats.saturating_sub(self.occupied_seats)
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            subject_code: self.subject_code.clone(),
            section_number: self.section_number.clone(),
            term_label: self.term_label.clone(),
            instructor: self.instructor.clone(),
            schedule: self.schedule.clone(),
        }
    }

    pub fn subject(&self) -> Subject {
        Subject {
            code: self.subject_code.clone(),
            name: self.subject_name.clone(),
        }
    }
}

static WATCH_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{3,4}[0-9]{4}$").expect("static regex"));

/// A validated subject code: 3-4 letters followed by 4 digits, upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchCode(String);

impl WatchCode {
    /// Validates user input. Surrounding whitespace and letter case are
    /// ignored; anything else must match the code pattern exactly.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let normalized = input.trim().to_uppercase();
        if WATCH_CODE_REGEX.is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(Error::ValidationError {
                input: input.to_string(),
                message: "expected 3 or 4 letters followed by 4 digits, e.g. FGA0001".to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatchCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

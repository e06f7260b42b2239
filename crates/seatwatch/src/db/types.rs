//! Database types for offering data

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{CourseOffering, Subject};

/// What an upsert did, with enough detail to detect an availability edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created {
        offering_id: i64,
        available: u32,
    },
    Updated {
        offering_id: i64,
        previous_available: u32,
        new_available: u32,
    },
}

impl UpsertOutcome {
    pub fn offering_id(&self) -> i64 {
        match *self {
            UpsertOutcome::Created { offering_id, .. } | UpsertOutcome::Updated { offering_id, .. } => {
                offering_id
            }
        }
    }

    /// True if the offering went from no seats (or not existing) to some seats.
    pub fn opened_seats(&self) -> bool {
        match *self {
            UpsertOutcome::Created { available, .. } => available > 0,
            UpsertOutcome::Updated {
                previous_available,
                new_available,
                ..
            } => previous_available == 0 && new_available > 0,
        }
    }
}

/// A stored offering joined with its subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbOffering {
    pub offering_id: i64,
    pub subject: Subject,
    pub offering: CourseOffering,
    pub available_seats: u32,
    pub last_seen_at: String,
}

/// Display projections over the same stored rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferingView {
    #[default]
    Full,
    Availability,
    Occupied,
    Offered,
}

impl FromStr for OfferingView {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "full" | "all" => Ok(OfferingView::Full),
            "availability" | "available" => Ok(OfferingView::Availability),
            "occupied" => Ok(OfferingView::Occupied),
            "offered" => Ok(OfferingView::Offered),
            _ => Err(Error::ValidationError {
                input: s.to_string(),
                message: "view must be one of: availability, occupied, offered".to_string(),
            }),
        }
    }
}

/// A presentation row; seat columns outside the chosen view are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferingRow {
    pub code: String,
    pub name: String,
    pub section: String,
    pub term: String,
    pub instructor: String,
    pub schedule: String,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offered: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupied: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<u32>,
}

impl DbOffering {
    pub fn project(&self, view: OfferingView) -> OfferingRow {
        let o = &self.offering;
        let (offered, occupied, available) = match view {
            OfferingView::Full => (
                Some(o.offered_seats),
                Some(o.occupied_seats),
                Some(self.available_seats),
            ),
            OfferingView::Availability => (None, None, Some(self.available_seats)),
            OfferingView::Occupied => (None, Some(o.occupied_seats), None),
            OfferingView::Offered => (Some(o.offered_seats), None, None),
        };

        OfferingRow {
            code: self.subject.code.clone(),
            name: self.subject.name.clone(),
            section: o.section_number.clone(),
            term: o.term_label.clone(),
            instructor: o.instructor.clone(),
            schedule: o.schedule.clone(),
            location: o.location.clone(),
            offered,
            occupied,
            available,
        }
    }
}

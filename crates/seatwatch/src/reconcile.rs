//! Merges a snapshot into the offering store and finds offerings that just
//! gained open seats.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::db::{OfferingStore, UpsertOutcome};
use crate::error::Result;
use crate::types::{CourseOffering, IdentityKey, Subject};

/// An offering that went from zero to some available seats in this merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub offering_id: i64,
    pub subject: Subject,
    pub offering: CourseOffering,
    pub available_seats: u32,
}

/// Counters for one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subjects_created: usize,
    pub created: usize,
    pub updated: usize,
    pub transitions: Vec<Transition>,
}

/// Upserts every offering of `snapshot` (subject first) and returns the
/// availability-transition set.
///
/// A snapshot may list the same identity key twice; only the first sighting
/// is merged so one cycle yields at most one transition per offering.
pub fn reconcile(store: &OfferingStore, snapshot: &[CourseOffering]) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut seen_subjects: HashSet<&str> = HashSet::new();
    let mut seen_keys: HashSet<IdentityKey> = HashSet::new();

    for offering in snapshot {
        if !seen_keys.insert(offering.identity_key()) {
            debug!(
                subject = %offering.subject_code,
                section = %offering.section_number,
                "Skipping duplicate identity key within snapshot"
            );
            continue;
        }

        if seen_subjects.insert(offering.subject_code.as_str())
            && store.upsert_subject(&offering.subject())?
        {
            report.subjects_created += 1;
        }

        let outcome = store.upsert(offering)?;
        match outcome {
            UpsertOutcome::Created { .. } => report.created += 1,
            UpsertOutcome::Updated { .. } => report.updated += 1,
        }

        if outcome.opened_seats() {
            report.transitions.push(Transition {
                offering_id: outcome.offering_id(),
                subject: offering.subject(),
                offering: offering.clone(),
                available_seats: offering.available_seats(),
            });
        }
    }

    info!(
        offerings = snapshot.len(),
        subjects_created = report.subjects_created,
        created = report.created,
        updated = report.updated,
        transitions = report.transitions.len(),
        "Snapshot reconciled"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offering(code: &str, section: &str, offered: u32, occupied: u32) -> CourseOffering {
        CourseOffering {
            subject_code: code.into(),
            subject_name: format!("Subject {code}"),
            section_number: section.into(),
            term_label: "2025.2".into(),
            instructor: "ANA".into(),
            schedule: "24M12".into(),
            offered_seats: offered,
            occupied_seats: occupied,
            location: "S1".into(),
        }
    }

    fn keys(report: &ReconcileReport) -> Vec<IdentityKey> {
        report
            .transitions
            .iter()
            .map(|t| t.offering.identity_key())
            .collect()
    }

    #[test]
    fn test_transition_only_on_edge() {
        let store = OfferingStore::open_in_memory().unwrap();
        let full = offering("FGA0001", "01", 30, 30);

        let first = reconcile(&store, &[full.clone()]).unwrap();
        assert!(first.transitions.is_empty());
        assert_eq!(first.created, 1);
        assert_eq!(first.subjects_created, 1);

        let opened = offering("FGA0001", "01", 30, 27);
        let second = reconcile(&store, &[opened.clone()]).unwrap();
        assert_eq!(keys(&second), vec![opened.identity_key()]);
        assert_eq!(second.transitions[0].available_seats, 3);

        let still_open = offering("FGA0001", "01", 30, 25);
        let third = reconcile(&store, &[still_open]).unwrap();
        assert!(third.transitions.is_empty());
        assert_eq!(third.updated, 1);
    }

    #[test]
    fn test_new_open_offering_is_a_transition() {
        let store = OfferingStore::open_in_memory().unwrap();
        let report = reconcile(
            &store,
            &[offering("FGA0001", "01", 30, 10), offering("FGA0001", "02", 30, 30)],
        )
        .unwrap();
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].offering.section_number, "01");
    }

    #[test]
    fn test_same_snapshot_twice_is_idempotent() {
        let store = OfferingStore::open_in_memory().unwrap();
        let snapshot = vec![
            offering("FGA0001", "01", 30, 10),
            offering("FGA0002", "01", 20, 20),
        ];

        reconcile(&store, &snapshot).unwrap();
        let before = store.query_all().unwrap();
        let again = reconcile(&store, &snapshot).unwrap();
        let after = store.query_all().unwrap();

        assert!(again.transitions.is_empty());
        assert_eq!(before.len(), after.len());
        let strip = |rows: Vec<crate::db::DbOffering>| {
            rows.into_iter()
                .map(|r| (r.offering_id, r.offering, r.available_seats))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(before), strip(after));
    }

    #[test]
    fn test_seat_changes_never_duplicate_rows() {
        let store = OfferingStore::open_in_memory().unwrap();
        reconcile(&store, &[offering("FGA0001", "01", 30, 30)]).unwrap();
        reconcile(&store, &[offering("FGA0001", "01", 35, 12)]).unwrap();
        reconcile(&store, &[offering("FGA0001", "01", 35, 35)]).unwrap();
        assert_eq!(store.query_all().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_key_in_snapshot_counts_once() {
        let store = OfferingStore::open_in_memory().unwrap();
        let open = offering("FGA0001", "01", 30, 10);
        let report = reconcile(&store, &[open.clone(), open]).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.transitions.len(), 1);
    }
}

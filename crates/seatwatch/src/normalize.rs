//! Turns harvested rows into typed offerings.

use tracing::warn;

use crate::error::Error;
use crate::types::{fields, CourseOffering, RawRecord};

/// Result of normalizing one snapshot.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub offerings: Vec<CourseOffering>,
    /// Rows that were dropped, with the reason.
    pub rejected: Vec<Error>,
}

/// Normalizes a whole snapshot. Malformed rows are logged and dropped; the
/// rest of the batch is kept.
pub fn normalize_batch(records: &[RawRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();

    for (index, record) in records.iter().enumerate() {
        match normalize_record(record) {
            Ok(offering) => batch.offerings.push(offering),
            Err(e) => {
                warn!(row = index, error = %e, "Dropping malformed record");
                batch.rejected.push(e);
            }
        }
    }

    batch
}

/// Normalizes a single harvested row.
pub fn normalize_record(record: &RawRecord) -> Result<CourseOffering, Error> {
    let subject_code = text(record, fields::SUBJECT_CODE).to_uppercase();
    if subject_code.is_empty() {
        return Err(malformed(format!("missing `{}`", fields::SUBJECT_CODE)));
    }

    let offered_seats = seat_count(record, fields::OFFERED)?;
    let occupied_seats = seat_count(record, fields::OCCUPIED)?;

    Ok(CourseOffering {
        subject_code,
        subject_name: collapse_whitespace(&text(record, fields::SUBJECT_NAME)),
        section_number: text(record, fields::SECTION),
        term_label: text(record, fields::TERM),
        instructor: collapse_whitespace(&text(record, fields::INSTRUCTOR)),
        schedule: collapse_whitespace(&text(record, fields::SCHEDULE)),
        offered_seats,
        occupied_seats,
        location: collapse_whitespace(&text(record, fields::LOCATION)),
    })
}

fn text(record: &RawRecord, key: &str) -> String {
    record
        .get(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Identity fields are compared verbatim across cycles, so runs of
/// whitespace from the page markup are folded into one space.
fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn seat_count(record: &RawRecord, key: &str) -> Result<u32, Error> {
    let raw = record
        .get(key)
        .map(|v| v.trim())
        .ok_or_else(|| malformed(format!("missing `{key}`")))?;

    raw.parse::<u32>()
        .map_err(|_| malformed(format!("`{key}` is not a non-negative integer: {raw:?}")))
}

fn malformed(reason: String) -> Error {
    Error::MalformedRecord { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(code: &str, offered: &str, occupied: &str) -> RawRecord {
        [
            (fields::SUBJECT_CODE, code),
            (fields::SUBJECT_NAME, "Cálculo  1"),
            (fields::SECTION, "01"),
            (fields::TERM, "2025.2"),
            (fields::INSTRUCTOR, "MARIA   SILVA"),
            (fields::SCHEDULE, "35T23"),
            (fields::OFFERED, offered),
            (fields::OCCUPIED, occupied),
            (fields::LOCATION, "FGA - S1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_normalize_valid_record() {
        let offering = normalize_record(&raw("fga0001", " 40 ", "37")).unwrap();
        assert_eq!(offering.subject_code, "FGA0001");
        assert_eq!(offering.subject_name, "Cálculo 1");
        assert_eq!(offering.instructor, "MARIA SILVA");
        assert_eq!(offering.offered_seats, 40);
        assert_eq!(offering.occupied_seats, 37);
        assert_eq!(offering.available_seats(), 3);
    }

    #[test]
    fn test_reported_available_is_ignored() {
        let mut record = raw("FGA0001", "40", "40");
        record.insert(fields::AVAILABLE.to_string(), "12".to_string());
        let offering = normalize_record(&record).unwrap();
        assert_eq!(offering.available_seats(), 0);
    }

    #[test]
    fn test_negative_or_text_seats_are_malformed() {
        assert!(matches!(
            normalize_record(&raw("FGA0001", "-1", "0")),
            Err(Error::MalformedRecord { .. })
        ));
        assert!(matches!(
            normalize_record(&raw("FGA0001", "40", "n/a")),
            Err(Error::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let mut record = raw("FGA0001", "40", "0");
        record.remove(fields::OCCUPIED);
        assert!(normalize_record(&record).is_err());

        assert!(normalize_record(&raw("  ", "40", "0")).is_err());
    }

    #[test]
    fn test_batch_keeps_good_rows() {
        let records = vec![
            raw("FGA0001", "40", "0"),
            raw("FGA0002", "forty", "0"),
            raw("FGA0003", "10", "10"),
        ];
        let batch = normalize_batch(&records);
        assert_eq!(batch.offerings.len(), 2);
        assert_eq!(batch.rejected.len(), 1);
        assert!(matches!(batch.rejected[0], Error::MalformedRecord { .. }));
    }
}

//! Durable store for subscriber watches.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use super::{lock, open_memory_with_schema, open_with_schema};
use crate::error::{Error, Result};
use crate::types::SubscriberId;

const SCHEMA_SQL: &str = include_str!("../../../../sql/init_subscriptions.sql");

/// Maps subscribers to the subject codes they watch. Codes are stored as
/// given; validating them is the caller's job.
pub struct SubscriptionStore {
    db: Mutex<Connection>,
}

impl SubscriptionStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_with_schema(db_path.as_ref(), SCHEMA_SQL)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(open_memory_with_schema(SCHEMA_SQL)?),
        })
    }

    /// Adds a watch. Returns false if the pair already existed.
    pub fn add_subscription(&self, subscriber: SubscriberId, code: &str) -> Result<bool> {
        let db = lock(&self.db)?;
        let inserted = db.execute(
            "INSERT INTO subscriptions (subscriber_id, watched_code, created_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(subscriber_id, watched_code) DO NOTHING",
            (subscriber, code),
        )?;
        Ok(inserted > 0)
    }

    /// Subscribers watching `code`.
    pub fn list_by_subject(&self, code: &str) -> Result<Vec<SubscriberId>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(
            "SELECT subscriber_id FROM subscriptions
             WHERE watched_code = ?1
             ORDER BY subscription_id",
        )?;
        let rows = stmt.query_map([code], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Codes watched by one subscriber.
    pub fn list_for_subscriber(&self, subscriber: SubscriberId) -> Result<Vec<String>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(
            "SELECT watched_code FROM subscriptions
             WHERE subscriber_id = ?1
             ORDER BY watched_code",
        )?;
        let rows = stmt.query_map([subscriber], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn list_all(&self) -> Result<Vec<(SubscriberId, String)>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare(
            "SELECT subscriber_id, watched_code FROM subscriptions ORDER BY subscription_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Removes a watch. Returns false if there was nothing to remove.
    pub fn remove(&self, subscriber: SubscriberId, code: &str) -> Result<bool> {
        let db = lock(&self.db)?;
        let removed = db.execute(
            "DELETE FROM subscriptions WHERE subscriber_id = ?1 AND watched_code = ?2",
            (subscriber, code),
        )?;
        Ok(removed > 0)
    }

    pub fn count_by_subject(&self, code: &str) -> Result<u64> {
        let db = lock(&self.db)?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE watched_code = ?1",
            [code],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let store = SubscriptionStore::open_in_memory().unwrap();
        assert!(store.add_subscription(42, "FGA0001").unwrap());
        assert!(!store.add_subscription(42, "FGA0001").unwrap());

        assert_eq!(store.list_by_subject("FGA0001").unwrap(), vec![42]);
        assert_eq!(store.count_by_subject("FGA0001").unwrap(), 1);
    }

    #[test]
    fn test_list_and_remove() {
        let store = SubscriptionStore::open_in_memory().unwrap();
        store.add_subscription(1, "FGA0001").unwrap();
        store.add_subscription(2, "FGA0001").unwrap();
        store.add_subscription(1, "FCTE0099").unwrap();

        assert_eq!(store.list_by_subject("FGA0001").unwrap(), vec![1, 2]);
        assert_eq!(
            store.list_for_subscriber(1).unwrap(),
            vec!["FCTE0099".to_string(), "FGA0001".to_string()]
        );
        assert_eq!(store.list_all().unwrap().len(), 3);

        assert!(store.remove(1, "FGA0001").unwrap());
        assert!(!store.remove(1, "FGA0001").unwrap());
        assert_eq!(store.list_by_subject("FGA0001").unwrap(), vec![2]);
    }
}

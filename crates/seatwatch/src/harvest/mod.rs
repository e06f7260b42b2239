//! Snapshot producers.

mod sigaa;

pub use sigaa::{parse_listing, HarvesterConfig, SigaaHarvester};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::RawRecord;

/// Produces raw offering rows from the registration portal.
///
/// Implementations own a session (HTTP client, browser, ...) that the
/// supervisor recycles after a failed cycle and releases on shutdown.
#[async_trait]
pub trait Harvester: Send {
    /// Fetches one snapshot. Any error fails the whole cycle.
    async fn produce_snapshot(&mut self) -> Result<Vec<RawRecord>>;

    /// Discards the current session and starts a fresh one.
    async fn recycle(&mut self) -> Result<()>;

    /// Releases the session for good.
    async fn release(&mut self);
}

//! Watches a university class listing for open seats and notifies the
//! subscribers watching those subjects.
//!
//! One cycle of the scrape loop harvests the listing, normalizes the rows,
//! reconciles them into the offering store and notifies subscribers of every
//! offering whose free seats went from zero to positive.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod harvest;
pub mod normalize;
pub mod notify;
pub mod reconcile;
pub mod server;
pub mod supervisor;
pub mod types;

pub use error::{Error, Result};

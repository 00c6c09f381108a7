//! `SQLite` account cache store.
//!
//! Persists one [`AccountSnapshot`](anchor_core::AccountSnapshot) per
//! `(account_number, region, lookup_type)` with its records and grouping keys
//! in child tables, and answers the host lookups behind co-residency checks.

mod db;
mod models;
mod queries;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests;

pub use anchor_core::db::DatabaseError;
pub use db::CacheStore;
pub use models::{AccountRow, ServerRow, VolumeRow};

//! Anchor server library.
//!
//! Refreshes per-account snapshots of servers and volumes from the cloud
//! provider, caches them in `SQLite`, and answers co-residency questions
//! over a JSON API.

pub mod api;
pub mod auth;
pub mod builder;
pub mod cloud;
pub mod context;
pub mod coresidency;
pub mod jobs;
pub mod store;
pub mod tasks;

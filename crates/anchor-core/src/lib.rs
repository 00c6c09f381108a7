//! Anchor Core Library
//!
//! Shared functionality for Anchor components:
//! - Canonical server/volume records and account snapshots
//! - Normalization of the two compute API generations into one record shape
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and common error types

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod normalize;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{
    AccountSnapshot, AddressClass, Addresses, Generation, KeyGroup, LookupType, Records,
    ServerRecord, ServerRef, VolumeRecord,
};

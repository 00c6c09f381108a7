//! Upstream cloud provider integration.
//!
//! Provides a reqwest-based client for the current- and legacy-generation
//! compute APIs, the block-storage API, and the identity token check.

mod client;


pub use client::{AUTH_TOKEN_HEADER, CloudClient, FetchError, ServerListing};

#![deny(unsafe_code)]

//! Shared test utilities for the Merino workspace.
//!
//! Provides reusable fixtures, config builders, a scripted sandbox
//! provider, and an in-memory shepherd so that individual crate tests stay
//! concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! merino-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod provider;
pub mod shepherd;
pub mod tracing_setup;

#![deny(unsafe_code)]

//! Shared test utilities for the chat gateway workspace.
//!
//! Provides reusable fixtures, config builders, mock ports, and tracing
//! helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! chatgate-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod fixtures;
pub mod mocks;
pub mod tracing_setup;

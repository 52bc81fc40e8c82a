#![deny(unsafe_code)]

//! Shared test utilities for the berth workspace.
//!
//! Provides reusable fixtures, config builders, and tracing helpers so that
//! individual crate tests stay concise and consistent. The [`fake_daemon`]
//! module runs a scripted Engine API daemon on a temporary Unix socket, and
//! [`executor`] records runtime invocations instead of spawning processes.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! berth-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod executor;
pub mod fake_daemon;
pub mod tracing_setup;

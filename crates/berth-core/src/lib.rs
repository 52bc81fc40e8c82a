#![deny(unsafe_code)]

//! berth core: an Engine API gateway.
//!
//! Every request arriving on the gateway's listeners is either relayed to the
//! real daemon under one of four transport disciplines, or translated into a
//! command line for an external container runtime whose output is streamed
//! live. The backend is chosen once, from configuration, at startup.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, the return type for async trait
/// methods that must stay object-safe (`dyn Executor`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Transport mode classification.
pub mod classify;
/// Gateway daemon runtime.
pub mod daemon;
/// Request-scoped errors and their HTTP rendering.
pub mod error;
/// External runtime process execution.
pub mod executor;
/// Request router and backend dispatch.
pub mod gateway;
/// TCP and Unix listeners.
pub mod listener;
/// Request view and path patterns.
pub mod request;
/// Shutdown coordination.
pub mod shutdown;
/// Engine API to runtime command translation.
pub mod translate;
/// Real-daemon transport handlers.
pub mod transport;

pub use classify::{TransportMode, classify};
pub use daemon::{Daemon, DaemonError};
pub use error::GatewayError;
pub use executor::{CommandSpec, ExecError, ExecOutcome, Executor, ProcessExecutor};
pub use gateway::{Backend, GatewayState, RuntimeAdaptor, router};
pub use request::IncomingRequest;
pub use shutdown::ShutdownCoordinator;
pub use translate::RuntimeTranslator;
pub use transport::{DaemonDialer, DaemonProxy};

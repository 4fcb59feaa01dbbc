//! # Void Node
//!
//! Runtime hosting a single `VoidCore`.
//!
//! ## Modules
//!
//! - `config/` - Node configuration from the environment
//! - `handlers/` - Built-in `system.*` intent handlers
//! - `metrics/` - Bus metrics exported to Prometheus
//! - `runtime/` - Startup, transport selection and shutdown

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod runtime;

pub use config::{NodeConfig, TransportKind};
pub use runtime::NodeRuntime;

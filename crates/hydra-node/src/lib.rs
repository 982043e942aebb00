//! # Hydra Node
//!
//! Runtime for one cluster member: configuration loading, the built-in bus
//! handlers and the serve/shutdown lifecycle. The `hydra-node` binary is a
//! thin wrapper around [`NodeRuntime`].

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod handlers;
pub mod runtime;

pub use config::{load_config, NodeConfig};
pub use handlers::{register_builtin_handlers, PingHandler, StatusHandler, StatusReport};
pub use runtime::NodeRuntime;

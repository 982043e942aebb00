//! # Hydra Bus - Cluster Messaging for Bot Processes
//!
//! Lets the processes of one cluster coordinate over two transports:
//!
//! - **Multicast:** best-effort broadcast of cluster-wide notifications
//!   (`publish` / `subscribe`).
//! - **Directed:** point-to-point work items with an optional correlated
//!   reply (`send` / `request`).
//!
//! ```text
//!  ┌──────────────┐   publish()    ┌────────────────┐   listen()   ┌──────────────┐
//!  │   Process A  │ ─────────────▶ │ multicast group│ ───────────▶ │  Process B   │
//!  │              │                └────────────────┘              │              │
//!  │              │   request()    ┌────────────────┐   handler    │              │
//!  │              │ ─────────────▶ │   TCP stream   │ ───────────▶ │  Dispatcher  │
//!  │  Correlation │ ◀───────────── │                │ ◀─────────── │              │
//!  │    Table     │  __hydra.reply └────────────────┘              └──────────────┘
//!  └──────────────┘
//! ```
//!
//! [`Bus`] is the only type most callers need.
//!
//! ## Delivery
//!
//! - Multicast is at-most-once with no duplicate suppression.
//! - Directed requests resolve exactly once: reply, timeout, transport
//!   failure, remote handler failure, or shutdown.
//! - The bus never retries. See [`retry`] for caller-side policy.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod address;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod directed;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod multicast;
pub mod retry;

// Re-export main types
pub use address::{ChannelKind, PeerAddress};
pub use bus::Bus;
pub use config::BusConfig;
pub use correlation::CorrelationTable;
pub use dispatcher::{
    handler_fn, DispatchOutcome, Dispatcher, ForwardHandler, Handler, HandlerResult, Message,
    SubscriptionId, TopicPattern,
};
pub use envelope::{Envelope, EnvelopeCodec, REPLY_ERROR_TOPIC, REPLY_TOPIC};
pub use error::{BusError, ConfigError, DecodeError};
pub use retry::{request_with_retry, RetryPolicy};

/// Wire protocol version written into every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default upper bound on a frame body, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Topics starting with this prefix belong to the bus itself.
pub const RESERVED_TOPIC_PREFIX: &str = "__hydra.";

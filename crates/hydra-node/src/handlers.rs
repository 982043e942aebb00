//! Built-in directed handlers every node serves.
//!
//! - `hydra.ping` replies `pong` (liveness check from the controller).
//! - `hydra.status` replies a JSON [`StatusReport`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hydra_bus::{Bus, Handler, HandlerResult, Message, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Topic answered by [`PingHandler`].
pub const PING_TOPIC: &str = "hydra.ping";

/// Topic answered by [`StatusHandler`].
pub const STATUS_TOPIC: &str = "hydra.status";

/// Replies `pong` to every request.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        debug!(correlation_id = ?message.correlation_id, "Ping");
        Ok(Some(Bytes::from_static(b"pong")))
    }
}

/// Snapshot of a node's bus state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node: String,
    pub multicast: bool,
    pub requests: bool,
    pub serving: Option<String>,
    pub pending_requests: usize,
    pub subscriptions: usize,
}

impl StatusReport {
    /// Read the current state of `bus`.
    #[must_use]
    pub fn collect(node: &str, bus: &Bus) -> Self {
        Self {
            node: node.to_string(),
            multicast: bus.multicast_enabled(),
            requests: bus.requests_enabled(),
            serving: bus.directed_local_addr().map(|addr| addr.to_string()),
            pending_requests: bus.pending_requests(),
            subscriptions: bus.subscription_count(),
        }
    }
}

/// Replies a JSON [`StatusReport`].
///
/// Holds the bus weakly: the bus owns its handlers.
pub struct StatusHandler {
    node: String,
    bus: Weak<Bus>,
}

impl StatusHandler {
    #[must_use]
    pub fn new(node: impl Into<String>, bus: &Arc<Bus>) -> Self {
        Self {
            node: node.into(),
            bus: Arc::downgrade(bus),
        }
    }
}

#[async_trait]
impl Handler for StatusHandler {
    async fn handle(&self, _message: &Message) -> HandlerResult {
        let bus = self.bus.upgrade().context("bus is gone")?;
        let report = StatusReport::collect(&self.node, &bus);
        let json = serde_json::to_vec(&report).context("failed to encode status")?;
        Ok(Some(Bytes::from(json)))
    }
}

/// Subscribe the built-in handlers on `bus`.
///
/// # Errors
///
/// Only if a built-in topic were rejected by the bus.
pub fn register_builtin_handlers(bus: &Arc<Bus>, node: &str) -> Result<Vec<SubscriptionId>> {
    let ping = bus.subscribe(PING_TOPIC, Arc::new(PingHandler))?;
    let status = bus.subscribe(STATUS_TOPIC, Arc::new(StatusHandler::new(node, bus)))?;
    Ok(vec![ping, status])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_bus::{BusConfig, ChannelKind, Envelope};

    fn message(topic: &str) -> Message {
        Message::new(Envelope::request(topic, Bytes::new(), 1), ChannelKind::Unicast, true)
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let reply = PingHandler.handle(&message(PING_TOPIC)).await.unwrap();
        assert_eq!(reply, Some(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_status_reports_bus_state() {
        let bus = Arc::new(
            Bus::start(BusConfig::default().with_listen_addr("127.0.0.1:0").unwrap())
                .await
                .unwrap(),
        );
        register_builtin_handlers(&bus, "worker-1").unwrap();

        let handler = StatusHandler::new("worker-1", &bus);
        let reply = handler.handle(&message(STATUS_TOPIC)).await.unwrap().unwrap();
        let report: StatusReport = serde_json::from_slice(&reply).unwrap();

        assert_eq!(report.node, "worker-1");
        assert!(!report.multicast);
        assert!(!report.requests);
        assert_eq!(report.serving, bus.directed_local_addr().map(|a| a.to_string()));
        assert_eq!(report.pending_requests, 0);
        assert_eq!(report.subscriptions, 2);
    }

    #[tokio::test]
    async fn test_status_fails_once_bus_dropped() {
        let bus = Arc::new(Bus::start(BusConfig::default()).await.unwrap());
        let handler = StatusHandler::new("gone", &bus);
        drop(bus);
        assert!(handler.handle(&message(STATUS_TOPIC)).await.is_err());
    }
}

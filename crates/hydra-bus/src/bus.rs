//! # Bus Facade
//!
//! The one type the rest of the application holds. Built explicitly from a
//! [`BusConfig`] and passed by reference (usually inside an `Arc`), so tests
//! can run several independent buses in one process.
//!
//! ## Lifecycle
//!
//! 1. [`Bus::start`] binds the sockets for every configured channel
//! 2. Callers register handlers with [`Bus::subscribe`]
//! 3. [`Bus::serve_forever`] runs both listen loops and the sweep timer
//! 4. [`Bus::shutdown`] stops the loops, closes sockets and fails every
//!    pending request with [`BusError::ShuttingDown`]

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::address::ChannelKind;
use crate::config::BusConfig;
use crate::correlation::CorrelationTable;
use crate::directed::{DirectedChannel, DirectedOptions};
use crate::dispatcher::{
    Dispatcher, ForwardHandler, Handler, Inbound, Message, SubscriptionId, TopicPattern,
};
use crate::envelope::EnvelopeCodec;
use crate::error::BusError;
use crate::multicast::MulticastChannel;

/// Pause before re-joining the multicast group after a socket failure.
const LISTEN_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Cluster messaging bus.
pub struct Bus {
    config: BusConfig,
    multicast: Option<MulticastChannel>,
    directed: Option<DirectedChannel>,
    dispatcher: Arc<Dispatcher>,
    correlation: Arc<CorrelationTable>,
    shutdown_tx: watch::Sender<bool>,
}

impl Bus {
    /// Bind every configured channel.
    ///
    /// A channel whose address is absent is disabled; calls that need it fail
    /// with [`BusError::ChannelUnavailable`].
    ///
    /// # Errors
    ///
    /// [`BusError::Config`] for invalid tuning values, [`BusError::Transport`]
    /// if a socket cannot be bound.
    pub async fn start(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;

        let codec = EnvelopeCodec::new(config.max_frame_len);
        let correlation = Arc::new(CorrelationTable::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&correlation)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let multicast = match &config.subscribe_addr {
            Some(group) => Some(MulticastChannel::bind(
                group.clone(),
                config.multicast_options(),
                codec,
            )?),
            None => {
                info!("Multicast channel disabled");
                None
            }
        };

        let directed = if config.directed_enabled() {
            let options = DirectedOptions {
                remote: config.remote_recv_addr.clone(),
                listen: config.listen_addr,
                connect_timeout: config.connect_timeout,
                write_timeout: config.write_timeout,
                inbox_capacity: config.inbox_capacity,
            };
            Some(DirectedChannel::bind(options, codec, Arc::clone(&correlation), shutdown_rx).await?)
        } else {
            info!("Directed channel disabled");
            None
        };

        info!(
            multicast = multicast.is_some(),
            directed = directed.is_some(),
            max_frame_len = config.max_frame_len,
            "Bus started"
        );

        Ok(Self {
            config,
            multicast,
            directed,
            dispatcher,
            correlation,
            shutdown_tx,
        })
    }

    /// Broadcast `payload` to every process subscribed to the group.
    ///
    /// # Errors
    ///
    /// [`BusError::ChannelUnavailable`] without a multicast group,
    /// [`BusError::ShuttingDown`] after shutdown, or the channel's errors.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), BusError> {
        self.ensure_running()?;
        self.multicast()?.publish(topic, payload.into()).await
    }

    /// Register `handler` for topics matching `pattern` (`*` suffix for a
    /// prefix match).
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidTopic`] for an empty or reserved pattern.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionId, BusError> {
        let pattern = TopicPattern::parse(pattern)?;
        Ok(self.dispatcher.subscribe(pattern, handler))
    }

    /// Subscribe with a channel instead of a callback.
    ///
    /// Messages are dropped (and logged) when the receiver falls `capacity`
    /// behind.
    ///
    /// # Errors
    ///
    /// As for [`Bus::subscribe`].
    pub fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<(SubscriptionId, mpsc::Receiver<Message>), BusError> {
        let (handler, rx) = ForwardHandler::channel(capacity);
        let id = self.subscribe(pattern, handler)?;
        Ok((id, rx))
    }

    /// [`Bus::subscribe_channel`] wrapped as a `Stream` for use with stream
    /// combinators.
    ///
    /// # Errors
    ///
    /// As for [`Bus::subscribe`].
    pub fn subscribe_stream(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<(SubscriptionId, ReceiverStream<Message>), BusError> {
        let (id, rx) = self.subscribe_channel(pattern, capacity)?;
        Ok((id, ReceiverStream::new(rx)))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Push a work item to the remote receiver without waiting for a reply.
    ///
    /// # Errors
    ///
    /// [`BusError::ChannelUnavailable`], [`BusError::ShuttingDown`], or the
    /// channel's errors.
    pub async fn send(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), BusError> {
        self.ensure_running()?;
        self.directed()?.send(topic, payload.into()).await
    }

    /// Send a request to the remote receiver and wait up to `timeout` for the
    /// reply payload.
    ///
    /// # Errors
    ///
    /// [`BusError::TimedOut`], [`BusError::Transport`], [`BusError::Remote`],
    /// [`BusError::ShuttingDown`] or [`BusError::ChannelUnavailable`].
    pub async fn request(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        self.ensure_running()?;
        self.directed()?.request(topic, payload.into(), timeout).await
    }

    /// [`Bus::request`] with the configured default timeout.
    ///
    /// # Errors
    ///
    /// As for [`Bus::request`].
    pub async fn request_default(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, BusError> {
        self.request(topic, payload, self.config.request_timeout).await
    }

    /// Run the listen loops and the sweep timer until shutdown.
    ///
    /// Envelopes are dispatched one at a time per channel; a handler that
    /// blocks stalls its channel. Disabled channels are simply not polled.
    /// Replies are resolved by the directed loop, so a process that sends
    /// requests must be serving as well.
    ///
    /// # Errors
    ///
    /// [`BusError::ShuttingDown`] if called after shutdown, or
    /// [`BusError::Transport`] if the multicast group cannot be joined.
    pub async fn serve_forever(&self) -> Result<(), BusError> {
        self.ensure_running()?;
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(
            multicast = self.multicast.is_some(),
            directed = self.directed.is_some(),
            "Bus serving"
        );

        let result = tokio::select! {
            result = self.multicast_loop() => result,
            result = self.directed_loop() => result,
            () = self.sweep_loop() => Ok(()),
            _ = shutdown.wait_for(|closed| *closed) => Ok(()),
        };

        info!("Bus stopped serving");
        result
    }

    /// Stop serving, close sockets and fail all pending requests.
    ///
    /// Idempotent. Every later call on the bus returns
    /// [`BusError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let failed = self.correlation.fail_all(&BusError::ShuttingDown);
        if let Some(multicast) = &self.multicast {
            multicast.close();
        }
        if let Some(directed) = &self.directed {
            directed.close().await;
        }
        info!(cancelled_requests = failed, "Bus shut down");
    }

    /// Whether [`Bus::shutdown`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Configuration the bus was started with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Number of requests waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.correlation.len()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.dispatcher.subscription_count()
    }

    /// Whether the multicast channel is configured.
    #[must_use]
    pub fn multicast_enabled(&self) -> bool {
        self.multicast.is_some()
    }

    /// Whether requests can be sent.
    #[must_use]
    pub fn requests_enabled(&self) -> bool {
        self.directed.as_ref().is_some_and(|d| d.remote().is_some())
    }

    /// Address the directed listener is bound to, if serving.
    #[must_use]
    pub fn directed_local_addr(&self) -> Option<SocketAddr> {
        self.directed.as_ref().and_then(DirectedChannel::local_addr)
    }

    /// The dispatcher shared by both channels.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        Ok(())
    }

    fn multicast(&self) -> Result<&MulticastChannel, BusError> {
        self.multicast
            .as_ref()
            .ok_or(BusError::ChannelUnavailable(ChannelKind::Multicast))
    }

    fn directed(&self) -> Result<&DirectedChannel, BusError> {
        self.directed
            .as_ref()
            .ok_or(BusError::ChannelUnavailable(ChannelKind::Unicast))
    }

    async fn multicast_loop(&self) -> Result<(), BusError> {
        let Some(channel) = &self.multicast else {
            return std::future::pending().await;
        };

        loop {
            let mut listener = channel.listen()?;
            loop {
                match listener.recv().await {
                    Ok(envelope) => {
                        self.dispatcher.dispatch(Inbound::broadcast(envelope)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Multicast listener failed, re-joining group");
                        break;
                    }
                }
            }
            tokio::time::sleep(LISTEN_RESTART_DELAY).await;
        }
    }

    async fn directed_loop(&self) -> Result<(), BusError> {
        let Some(channel) = &self.directed else {
            return std::future::pending().await;
        };

        let mut inbox = channel.listen();
        while let Some(inbound) = inbox.recv().await {
            let outcome = self.dispatcher.dispatch(inbound).await;
            debug!(?outcome, "Dispatched directed frame");
        }
        // Only reached once the channel is closed.
        Ok(())
    }

    async fn sweep_loop(&self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let evicted = self.correlation.sweep();
            if evicted > 0 {
                debug!(evicted, "Swept expired requests");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{handler_fn, HandlerResult};

    async fn server_and_client() -> (Arc<Bus>, Arc<Bus>) {
        let server = Bus::start(BusConfig::default().with_listen_addr("127.0.0.1:0").unwrap())
            .await
            .unwrap();
        let addr = server.directed_local_addr().unwrap().to_string();
        let client = Bus::start(BusConfig::default().with_remote_recv_addr(&addr).unwrap())
            .await
            .unwrap();
        (Arc::new(server), Arc::new(client))
    }

    fn serve(bus: &Arc<Bus>) -> tokio::task::JoinHandle<Result<(), BusError>> {
        let bus = Arc::clone(bus);
        tokio::spawn(async move { bus.serve_forever().await })
    }

    #[tokio::test]
    async fn test_disabled_channels_fail_fast() {
        let bus = Bus::start(BusConfig::default()).await.unwrap();

        assert_eq!(
            bus.publish("cache.invalidate", &b"x"[..]).await,
            Err(BusError::ChannelUnavailable(ChannelKind::Multicast))
        );
        assert_eq!(
            bus.send("work", Bytes::new()).await,
            Err(BusError::ChannelUnavailable(ChannelKind::Unicast))
        );
        assert_eq!(
            bus.request("ping", Bytes::new(), Duration::from_secs(1)).await,
            Err(BusError::ChannelUnavailable(ChannelKind::Unicast))
        );
        assert!(!bus.requests_enabled());
        assert!(bus.directed_local_addr().is_none());
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (server, client) = server_and_client().await;
        server
            .subscribe(
                "ping",
                handler_fn(|_msg: Message| async { HandlerResult::Ok(Some(Bytes::from_static(b"pong"))) }),
            )
            .unwrap();
        let _server_task = serve(&server);
        let _client_task = serve(&client);

        let reply = client
            .request("ping", Bytes::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"pong"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_request() {
        let (server, client) = server_and_client().await;
        let _server_task = serve(&server);
        let client_task = serve(&client);

        let requester = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .request("slow.topic", Bytes::new(), Duration::from_secs(30))
                    .await
            })
        };

        for _ in 0..100 {
            if client.pending_requests() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client.shutdown().await;

        assert_eq!(requester.await.unwrap(), Err(BusError::ShuttingDown));
        assert_eq!(client_task.await.unwrap(), Ok(()));
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(
            client.send("work", Bytes::new()).await,
            Err(BusError::ShuttingDown)
        );
        assert_eq!(client.serve_forever().await, Err(BusError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let bus = Bus::start(BusConfig::default()).await.unwrap();
        bus.shutdown().await;
        bus.shutdown().await;
        assert!(bus.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_closes_multicast_socket() {
        let config = BusConfig::parse(
            r#"
            hydra_subscribe_addr = "239.255.42.97:45402"

            [hydra]
            multicast_ttl = 0
            multicast_interface = "127.0.0.1"
            "#,
        )
        .unwrap();
        let bus = Bus::start(config).await.unwrap();
        assert!(!bus.multicast().unwrap().is_closed());

        bus.shutdown().await;
        assert!(bus.multicast().unwrap().is_closed());
        assert_eq!(
            bus.publish("cache.invalidate", Bytes::new()).await,
            Err(BusError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_subscribe_rejects_reserved_pattern() {
        let bus = Bus::start(BusConfig::default()).await.unwrap();
        let result = bus.subscribe(
            "__hydra.reply",
            handler_fn(|_msg: Message| async { HandlerResult::Ok(None) }),
        );
        assert!(matches!(result, Err(BusError::InvalidTopic(_))));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_stream_yields_dispatched_messages() {
        use crate::envelope::Envelope;
        use tokio_stream::StreamExt;

        let bus = Bus::start(BusConfig::default()).await.unwrap();
        let (_id, mut stream) = bus.subscribe_stream("guild.*", 4).unwrap();

        bus.dispatcher()
            .dispatch(Inbound::broadcast(Envelope::new("guild.update", &b"42"[..])))
            .await;

        let message = stream.next().await.unwrap();
        assert_eq!(message.topic, "guild.update");
        assert_eq!(message.origin, ChannelKind::Multicast);
    }

    #[tokio::test]
    async fn test_subscribe_channel_and_unsubscribe() {
        let bus = Bus::start(BusConfig::default()).await.unwrap();
        let (id, _rx) = bus.subscribe_channel("guild.*", 4).unwrap();
        assert_eq!(bus.subscription_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }
}

//! # Directed Channel
//!
//! Point-to-point work over TCP, framed by [`EnvelopeCodec`].
//!
//! ## Requester side
//!
//! One outbound connection to the configured remote receiver, opened on first
//! use. A write failure is returned to the caller and drops the connection;
//! the next call reconnects. Frames read back on that connection (replies)
//! go to the inbox like any other directed frame.
//!
//! ## Serving side
//!
//! When a listen address is configured the listener is bound at start-up.
//! Each accepted connection gets a reader task that forwards frames to the
//! inbox together with a [`ReplySink`] writing back to the same connection.
//!
//! Every write is bounded by the write timeout. A peer that stops draining
//! its socket loses the connection instead of stalling the dispatch loop.
//!
//! ## Request lifecycle
//!
//! ```text
//! register(id) ──▶ transmit ──┬─ error ──────────▶ fail(id, Transport)
//!                             └─ ok ──▶ wait ──┬─ reply ────▶ resolve(id)
//!                                              ├─ deadline ─▶ fail(id, TimedOut)
//!                                              └─ shutdown ─▶ fail_all(ShuttingDown)
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::{ChannelKind, PeerAddress};
use crate::correlation::{deadline_after, CorrelationTable};
use crate::dispatcher::{Inbound, ReplySink};
use crate::envelope::{validate_topic, Envelope, EnvelopeCodec, ReadOutcome};
use crate::error::BusError;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type InboxSlot = Arc<RwLock<Option<mpsc::Sender<Inbound>>>>;
type OutboundSlot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Settings for [`DirectedChannel::bind`].
#[derive(Debug, Clone)]
pub struct DirectedOptions {
    /// Where requests are sent. `None` disables `send` and `request`.
    pub remote: Option<PeerAddress>,
    /// Where this process serves directed work. `None` disables serving.
    pub listen: Option<SocketAddr>,
    /// Bound on establishing the outbound connection.
    pub connect_timeout: Duration,
    /// Bound on writing one frame.
    pub write_timeout: Duration,
    /// Capacity of the inbox returned by `listen`.
    pub inbox_capacity: usize,
}

/// Write half of one TCP connection.
///
/// The writer is taken out once a write fails or times out; the reader task
/// is woken through `broken` and stops as well.
struct Connection {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    broken: Notify,
    peer: SocketAddr,
    codec: EnvelopeCodec,
    write_timeout: Duration,
}

impl Connection {
    fn new(writer: OwnedWriteHalf, peer: SocketAddr, codec: EnvelopeCodec, write_timeout: Duration) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            broken: Notify::new(),
            peer,
            codec,
            write_timeout,
        }
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), BusError> {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(BusError::Transport {
                op: "write",
                reason: "connection closed".into(),
            });
        };

        let error = match tokio::time::timeout(self.write_timeout, self.codec.write_frame(writer, envelope)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e @ BusError::Transport { .. })) => e,
            // Rejected before any byte was written; the stream is intact.
            Ok(Err(e)) => return Err(e),
            Err(_) => BusError::Transport {
                op: "write",
                reason: format!("peer did not drain within {:?}", self.write_timeout),
            },
        };

        // A partial frame leaves the stream misaligned.
        slot.take();
        self.broken.notify_one();
        Err(error)
    }

    async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.peer, error = %e, "Error closing directed connection");
            }
        }
        self.broken.notify_one();
    }
}

#[async_trait]
impl ReplySink for Connection {
    async fn send_reply(&self, reply: Envelope) -> Result<(), BusError> {
        self.write(&reply).await
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Point-to-point channel with correlated replies.
pub struct DirectedChannel {
    remote: Option<PeerAddress>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: Option<SocketAddr>,
    codec: EnvelopeCodec,
    connect_timeout: Duration,
    write_timeout: Duration,
    inbox_capacity: usize,
    outbound: OutboundSlot,
    inbox: InboxSlot,
    correlation: Arc<CorrelationTable>,
    shutdown: watch::Receiver<bool>,
}

impl DirectedChannel {
    /// Create the channel, binding the listener if one is configured.
    ///
    /// The outbound connection is not opened until the first send.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] if the listen address cannot be bound.
    pub async fn bind(
        options: DirectedOptions,
        codec: EnvelopeCodec,
        correlation: Arc<CorrelationTable>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, BusError> {
        let (listener, local_addr) = match options.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| BusError::transport("bind directed listener", e))?;
                let local = listener
                    .local_addr()
                    .map_err(|e| BusError::transport("bind directed listener", e))?;
                info!(addr = %local, "Directed listener bound");
                (Some(Arc::new(listener)), Some(local))
            }
            None => (None, None),
        };

        if let Some(remote) = &options.remote {
            info!(remote = %remote, "Directed requests go to remote receiver");
        }

        Ok(Self {
            remote: options.remote,
            listener: Mutex::new(listener),
            local_addr,
            codec,
            connect_timeout: options.connect_timeout,
            write_timeout: options.write_timeout,
            inbox_capacity: options.inbox_capacity,
            outbound: Arc::new(tokio::sync::Mutex::new(None)),
            inbox: Arc::new(RwLock::new(None)),
            correlation,
            shutdown,
        })
    }

    /// Address the listener is bound to, if serving.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Configured remote receiver.
    #[must_use]
    pub fn remote(&self) -> Option<&PeerAddress> {
        self.remote.as_ref()
    }

    /// Send a work item without waiting for any reply.
    ///
    /// # Errors
    ///
    /// - [`BusError::ChannelUnavailable`] without a remote receiver
    /// - [`BusError::InvalidTopic`] / [`BusError::FrameTooLarge`]
    /// - [`BusError::Transport`] if connecting or writing fails
    pub async fn send(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        validate_topic(topic)?;
        self.transmit(&Envelope::new(topic, payload)).await
    }

    /// Send a request and wait for its reply.
    ///
    /// Resolves with the reply payload, or with exactly one of `TimedOut`,
    /// `Transport`, `Remote` or `ShuttingDown`. The pending entry is gone
    /// from the correlation table when this returns.
    ///
    /// # Errors
    ///
    /// See above, plus the validation errors of [`DirectedChannel::send`].
    pub async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        validate_topic(topic)?;
        if self.remote.is_none() {
            return Err(BusError::ChannelUnavailable(ChannelKind::Unicast));
        }
        if *self.shutdown.borrow() {
            return Err(BusError::ShuttingDown);
        }

        let deadline = Instant::from_std(deadline_after(std::time::Instant::now(), timeout));
        let (id, mut result) = self.correlation.register(topic, timeout);

        // Shutdown may have run fail_all between the check above and register.
        if *self.shutdown.borrow() {
            self.correlation.fail(id, BusError::ShuttingDown);
        }

        let envelope = Envelope::request(topic, payload, id);
        match tokio::time::timeout_at(deadline, self.transmit(&envelope)).await {
            Ok(Ok(())) => debug!(correlation_id = id, topic, "Request sent"),
            Ok(Err(e)) => {
                self.correlation.fail(id, e);
            }
            // A write cut short leaves the stream misaligned. The timer below
            // fires at once.
            Err(_) => self.reset_outbound().await,
        }

        let outcome = tokio::select! {
            outcome = &mut result => outcome,
            () = tokio::time::sleep_until(deadline) => {
                self.correlation.fail(id, BusError::TimedOut {
                    topic: topic.to_string(),
                    after: timeout,
                });
                // Either our TimedOut or a reply that won the race.
                result.await
            }
        };

        outcome.unwrap_or(Err(BusError::ShuttingDown))
    }

    /// Write one envelope on the outbound connection.
    ///
    /// # Errors
    ///
    /// As for [`DirectedChannel::send`].
    pub async fn transmit(&self, envelope: &Envelope) -> Result<(), BusError> {
        let connection = self.connection().await?;
        match connection.write(envelope).await {
            Ok(()) => Ok(()),
            Err(e @ BusError::Transport { .. }) => {
                warn!(peer = %connection.peer, error = %e, "Directed write failed, dropping connection");
                self.drop_connection(&connection).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Start delivering inbound frames to a fresh inbox.
    ///
    /// Replaces any previous inbox; the previous accept loop stops once its
    /// receiver is dropped. Frames arriving while no inbox is active are
    /// dropped.
    pub fn listen(&self) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(self.inbox_capacity);
        *self.inbox.write() = Some(tx.clone());

        if let Some(listener) = self.listener.lock().clone() {
            tokio::spawn(accept_loop(
                listener,
                tx,
                self.codec,
                self.write_timeout,
                Arc::clone(&self.inbox),
                self.shutdown.clone(),
            ));
        }
        rx
    }

    /// Close the outbound connection and release the listener.
    pub async fn close(&self) {
        let listener = self.listener.lock().take();
        drop(listener);
        *self.inbox.write() = None;

        let connection = self.outbound.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        info!("Directed channel closed");
    }

    async fn connection(&self) -> Result<Arc<Connection>, BusError> {
        let remote = self
            .remote
            .as_ref()
            .ok_or(BusError::ChannelUnavailable(ChannelKind::Unicast))?;

        let mut slot = self.outbound.lock().await;
        if *self.shutdown.borrow() {
            return Err(BusError::ShuttingDown);
        }
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(remote.socket_addr()))
            .await
            .map_err(|_| BusError::Transport {
                op: "connect",
                reason: format!("no connection within {:?}", self.connect_timeout),
            })?
            .map_err(|e| BusError::transport("connect", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| BusError::transport("connect", e))?;

        let (reader, writer) = stream.into_split();
        let connection = Arc::new(Connection::new(
            writer,
            remote.socket_addr(),
            self.codec,
            self.write_timeout,
        ));

        tokio::spawn(read_loop(
            reader,
            Arc::clone(&connection),
            self.codec,
            Arc::clone(&self.inbox),
            self.shutdown.clone(),
            Some(Arc::clone(&self.outbound)),
        ));

        info!(peer = %connection.peer, "Directed connection established");
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn reset_outbound(&self) {
        let connection = self.outbound.lock().await.take();
        if let Some(connection) = connection {
            warn!(peer = %connection.peer, "Directed write outlasted request deadline, dropping connection");
            connection.close().await;
        }
    }

    async fn drop_connection(&self, connection: &Arc<Connection>) {
        clear_outbound(&self.outbound, connection).await;
    }
}

async fn clear_outbound(outbound: &OutboundSlot, connection: &Arc<Connection>) {
    let mut slot = outbound.lock().await;
    if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, connection)) {
        *slot = None;
    }
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    tx: mpsc::Sender<Inbound>,
    codec: EnvelopeCodec,
    write_timeout: Duration,
    inbox: InboxSlot,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let accepted = tokio::select! {
            () = tx.closed() => break,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
                }
                debug!(peer = %peer, "Accepted directed connection");

                let (reader, writer) = stream.into_split();
                let connection = Arc::new(Connection::new(writer, peer, codec, write_timeout));
                tokio::spawn(read_loop(
                    reader,
                    connection,
                    codec,
                    Arc::clone(&inbox),
                    shutdown.clone(),
                    None,
                ));
            }
            Err(e) => {
                warn!(error = %e, "Directed accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Directed accept loop stopped");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    connection: Arc<Connection>,
    codec: EnvelopeCodec,
    inbox: InboxSlot,
    mut shutdown: watch::Receiver<bool>,
    outbound: Option<OutboundSlot>,
) {
    let peer = connection.peer;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let outcome = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            () = connection.broken.notified() => {
                debug!(peer = %peer, "Directed connection dropped after failed write");
                break;
            }
            outcome = codec.read_frame(&mut reader) => outcome,
        };

        match outcome {
            Ok(ReadOutcome::Frame(envelope)) => {
                let reply_to: Arc<dyn ReplySink> = connection.clone();
                forward(&inbox, Inbound::directed(envelope, Some(reply_to))).await;
            }
            Ok(ReadOutcome::Malformed(e)) => {
                warn!(peer = %peer, error = %e, "Dropping malformed directed frame");
            }
            Ok(ReadOutcome::Closed) => {
                debug!(peer = %peer, "Directed connection closed by peer");
                break;
            }
            Err(e) => {
                // Oversized prefix or I/O failure: the stream cannot be realigned.
                warn!(peer = %peer, error = %e, "Directed connection failed");
                break;
            }
        }
    }

    if let Some(outbound) = outbound {
        clear_outbound(&outbound, &connection).await;
    }
}

async fn forward(inbox: &InboxSlot, inbound: Inbound) {
    let tx = inbox.read().clone();
    match tx {
        Some(tx) => {
            if tx.send(inbound).await.is_err() {
                debug!("Directed inbox closed, dropping frame");
            }
        }
        None => debug!(topic = %inbound.envelope.topic, "No directed inbox, dropping frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::REPLY_TOPIC;

    fn options(remote: Option<SocketAddr>, listen: Option<SocketAddr>) -> DirectedOptions {
        DirectedOptions {
            remote: remote.map(|addr| PeerAddress::from_socket_addr(addr, ChannelKind::Unicast).unwrap()),
            listen,
            connect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_millis(200),
            inbox_capacity: 16,
        }
    }

    async fn channel(
        remote: Option<SocketAddr>,
        listen: Option<SocketAddr>,
    ) -> (DirectedChannel, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let channel = DirectedChannel::bind(
            options(remote, listen),
            EnvelopeCodec::default(),
            Arc::new(CorrelationTable::new()),
            rx,
        )
        .await
        .unwrap();
        (channel, tx)
    }

    #[tokio::test]
    async fn test_send_reaches_listener() {
        let (server, _s) = channel(None, Some("127.0.0.1:0".parse().unwrap())).await;
        let mut inbox = server.listen();
        let (client, _c) = channel(server.local_addr(), None).await;

        client.send("work.item", Bytes::from_static(b"job-1")).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.origin, ChannelKind::Unicast);
        assert_eq!(inbound.envelope.topic, "work.item");
        assert_eq!(inbound.envelope.correlation_id, None);
        assert!(inbound.reply_to.is_some());
    }

    #[tokio::test]
    async fn test_reply_travels_back_over_same_connection() {
        let (server, _s) = channel(None, Some("127.0.0.1:0".parse().unwrap())).await;
        let mut server_inbox = server.listen();
        let (client, _c) = channel(server.local_addr(), None).await;
        let mut client_inbox = client.listen();

        client
            .transmit(&Envelope::request("echo", Bytes::from_static(b"hi"), 9))
            .await
            .unwrap();

        let inbound = server_inbox.recv().await.unwrap();
        let sink = inbound.reply_to.unwrap();
        sink.send_reply(Envelope::reply(9, Bytes::from_static(b"hi")))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), client_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.topic, REPLY_TOPIC);
        assert_eq!(reply.envelope.correlation_id, Some(9));
    }

    #[tokio::test]
    async fn test_send_without_remote_is_unavailable() {
        let (client, _c) = channel(None, None).await;
        let result = client.send("work.item", Bytes::new()).await;
        assert_eq!(result, Err(BusError::ChannelUnavailable(ChannelKind::Unicast)));

        let result = client.request("work.item", Bytes::new(), Duration::from_millis(50)).await;
        assert_eq!(result, Err(BusError::ChannelUnavailable(ChannelKind::Unicast)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Bind and drop to get a port nobody listens on.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let (client, _c) = channel(Some(addr), None).await;

        let result = client.request("ping", Bytes::new(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BusError::Transport { op: "connect", .. })));
        assert!(client.correlation.is_empty());
    }

    #[tokio::test]
    async fn test_request_times_out_when_nobody_answers() {
        let (server, _s) = channel(None, Some("127.0.0.1:0".parse().unwrap())).await;
        let _inbox = server.listen();
        let (client, _c) = channel(server.local_addr(), None).await;

        let started = std::time::Instant::now();
        let result = client
            .request("unregistered.topic", Bytes::new(), Duration::from_millis(100))
            .await;

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(matches!(result, Err(BusError::TimedOut { .. })));
        assert!(client.correlation.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_request_before_sending() {
        let (client, stop) = channel(Some("127.0.0.1:9".parse().unwrap()), None).await;
        stop.send_replace(true);

        let result = client.request("ping", Bytes::new(), Duration::from_secs(1)).await;
        assert_eq!(result, Err(BusError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_write_to_stalled_peer_times_out_and_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, _c) = channel(Some(listener.local_addr().unwrap()), None).await;
        let payload = Bytes::from(vec![0u8; 60_000]);

        client.send("bulk", payload.clone()).await.unwrap();
        // Accepted but never read from.
        let (_stream, _) = listener.accept().await.unwrap();

        let mut failure = None;
        for _ in 0..2_000 {
            if let Err(e) = client.send("bulk", payload.clone()).await {
                failure = Some(e);
                break;
            }
        }
        assert!(
            matches!(failure, Some(BusError::Transport { op: "write", .. })),
            "{failure:?}"
        );
        assert!(client.outbound.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_request_with_unbounded_timeout_does_not_overflow() {
        let (server, _s) = channel(None, Some("127.0.0.1:0".parse().unwrap())).await;
        let mut server_inbox = server.listen();
        let (client, _c) = channel(server.local_addr(), None).await;
        let client = Arc::new(client);
        let mut client_inbox = client.listen();

        let requester = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("ping", Bytes::new(), Duration::MAX).await })
        };

        let inbound = server_inbox.recv().await.unwrap();
        let id = inbound.envelope.correlation_id.unwrap();
        inbound
            .reply_to
            .unwrap()
            .send_reply(Envelope::reply(id, Bytes::from_static(b"pong")))
            .await
            .unwrap();

        let reply = client_inbox.recv().await.unwrap();
        assert!(client.correlation.resolve(id, reply.envelope.payload));
        assert_eq!(requester.await.unwrap(), Ok(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_peer_close_clears_outbound_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _c) = channel(Some(addr), None).await;

        client.send("work.item", Bytes::new()).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        for _ in 0..50 {
            if client.outbound.lock().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("outbound connection was not cleared after peer close");
    }
}

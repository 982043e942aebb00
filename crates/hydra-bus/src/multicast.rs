//! # Multicast Channel
//!
//! Fire-and-forget broadcast over UDP multicast.
//!
//! - One datagram carries one frame.
//! - At-most-once, unordered across senders, no acknowledgment.
//! - No duplicate suppression: a frame duplicated by the network is delivered
//!   twice, so handlers must be idempotent.
//!
//! The publishing socket is bound once at start-up and released by
//! [`MulticastChannel::close`]. Each call to [`MulticastChannel::listen`]
//! binds a fresh receiving socket, so a failed listener can be restarted.
//!
//! A frame must fit in one IPv4 UDP datagram, whatever the codec's own limit.

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::envelope::{validate_topic, Envelope, EnvelopeCodec, LENGTH_PREFIX_LEN};
use crate::error::BusError;

/// Largest UDP payload over IPv4 (65,535 minus IP and UDP headers).
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Socket options for the multicast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastOptions {
    /// Hop limit for outgoing datagrams.
    pub ttl: u32,
    /// IPv4 interface used to send and to join the group. Unspecified lets
    /// the kernel pick.
    pub interface: Ipv4Addr,
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self {
            ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Broadcast channel bound to one multicast group.
pub struct MulticastChannel {
    group: PeerAddress,
    options: MulticastOptions,
    codec: EnvelopeCodec,
    max_datagram: usize,
    sender: Mutex<Option<Arc<UdpSocket>>>,
    published: AtomicU64,
}

impl MulticastChannel {
    /// Bind the publishing socket for `group`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] if the socket cannot be created or configured.
    pub fn bind(
        group: PeerAddress,
        options: MulticastOptions,
        codec: EnvelopeCodec,
    ) -> Result<Self, BusError> {
        let socket = sender_socket(group.socket_addr(), options)
            .and_then(UdpSocket::from_std)
            .map_err(|e| BusError::transport("bind multicast sender", e))?;

        info!(group = %group, ttl = options.ttl, "Multicast channel ready");

        Ok(Self {
            group,
            options,
            codec,
            max_datagram: (LENGTH_PREFIX_LEN + codec.max_frame_len()).min(MAX_DATAGRAM_LEN),
            sender: Mutex::new(Some(Arc::new(socket))),
            published: AtomicU64::new(0),
        })
    }

    /// The configured group.
    #[must_use]
    pub fn group(&self) -> &PeerAddress {
        &self.group
    }

    /// Broadcast `payload` on `topic`.
    ///
    /// Returns once the datagram is handed to the kernel; whether anyone
    /// receives it is unknown.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidTopic`] / [`BusError::FrameTooLarge`] before sending
    /// - [`BusError::ShuttingDown`] once the channel is closed
    /// - [`BusError::Transport`] if the kernel rejects the datagram
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        validate_topic(topic)?;
        let frame = self.codec.encode(&Envelope::new(topic, payload))?;
        if frame.len() > self.max_datagram {
            return Err(BusError::FrameTooLarge {
                len: frame.len() - LENGTH_PREFIX_LEN,
                max: self.max_datagram - LENGTH_PREFIX_LEN,
            });
        }
        let sender = self.sender.lock().clone().ok_or(BusError::ShuttingDown)?;

        self.published.fetch_add(1, Ordering::Relaxed);
        sender
            .send_to(&frame, self.group.socket_addr())
            .await
            .map_err(|e| BusError::transport("publish", e))?;

        debug!(topic, bytes = frame.len(), "Published multicast frame");
        Ok(())
    }

    /// Release the publishing socket. Later publishes fail with
    /// [`BusError::ShuttingDown`]; listeners already created are unaffected.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!(group = %self.group, "Multicast channel closed");
        }
    }

    /// Whether [`MulticastChannel::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Number of publish attempts so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Bind a receiving socket and join the group.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] if binding or joining fails.
    pub fn listen(&self) -> Result<MulticastListener, BusError> {
        let socket = receiver_socket(self.group.socket_addr(), self.options)
            .and_then(UdpSocket::from_std)
            .map_err(|e| BusError::transport("join multicast group", e))?;

        info!(group = %self.group, "Joined multicast group");

        Ok(MulticastListener {
            socket,
            codec: self.codec,
            buf: vec![0u8; self.max_datagram],
        })
    }
}

/// Receiving side of a multicast group membership.
pub struct MulticastListener {
    socket: UdpSocket,
    codec: EnvelopeCodec,
    buf: Vec<u8>,
}

impl MulticastListener {
    /// Wait for the next well-formed envelope.
    ///
    /// Malformed datagrams are logged and skipped.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] if the socket fails; the listener should then be
    /// dropped and a new one created.
    pub async fn recv(&mut self) -> Result<Envelope, BusError> {
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut self.buf)
                .await
                .map_err(|e| BusError::transport("multicast receive", e))?;

            match self.codec.decode(&self.buf[..len]) {
                Ok(envelope) => {
                    debug!(topic = %envelope.topic, peer = %from, "Received multicast frame");
                    return Ok(envelope);
                }
                Err(e) => {
                    warn!(peer = %from, bytes = len, error = %e, "Dropping malformed multicast frame");
                }
            }
        }
    }

    /// Turn the listener into a lazy stream that ends on socket failure.
    pub fn into_stream(self) -> impl Stream<Item = Envelope> {
        futures::stream::unfold(self, |mut listener| async move {
            match listener.recv().await {
                Ok(envelope) => Some((envelope, listener)),
                Err(e) => {
                    warn!(error = %e, "Multicast stream ended");
                    None
                }
            }
        })
    }
}

fn sender_socket(group: SocketAddr, options: MulticastOptions) -> io::Result<std::net::UdpSocket> {
    let socket = match group.ip() {
        IpAddr::V4(_) => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_multicast_ttl_v4(options.ttl)?;
            socket.set_multicast_loop_v4(true)?;
            if !options.interface.is_unspecified() {
                socket.set_multicast_if_v4(&options.interface)?;
            }
            socket.bind(&SockAddr::from(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)))?;
            socket
        }
        IpAddr::V6(_) => {
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_multicast_hops_v6(options.ttl)?;
            socket.set_multicast_loop_v6(true)?;
            socket.bind(&SockAddr::from(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)))?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn receiver_socket(group: SocketAddr, options: MulticastOptions) -> io::Result<std::net::UdpSocket> {
    let socket = match group.ip() {
        IpAddr::V4(ip) => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.bind(&SockAddr::from(SocketAddr::new(
                Ipv4Addr::UNSPECIFIED.into(),
                group.port(),
            )))?;
            socket.join_multicast_v4(&ip, &options.interface)?;
            socket
        }
        IpAddr::V6(ip) => {
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_only_v6(true)?;
            socket.bind(&SockAddr::from(SocketAddr::new(
                Ipv6Addr::UNSPECIFIED.into(),
                group.port(),
            )))?;
            socket.join_multicast_v6(&ip, 0)?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

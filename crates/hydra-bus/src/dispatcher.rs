//! # Dispatcher
//!
//! Routes decoded envelopes to registered handlers.
//!
//! For each inbound envelope:
//!
//! 1. A directed reply (`__hydra.reply*`) resolves its pending request and
//!    stops there. Replies are never delivered to subscribers.
//! 2. Otherwise every subscription whose pattern matches the topic is invoked
//!    in registration order. A handler that fails or panics is logged and the
//!    remaining handlers still run.
//! 3. If the envelope was a directed request, the first reply produced is
//!    sent back through the envelope's [`ReplySink`].
//!
//! The subscription list is guarded by a lock that is never held across an
//! `.await`, so handlers may subscribe or unsubscribe while being invoked.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::ChannelKind;
use crate::correlation::CorrelationTable;
use crate::envelope::{Envelope, REPLY_TOPIC};
use crate::error::BusError;
use crate::RESERVED_TOPIC_PREFIX;

/// What a handler returns: an optional reply payload.
///
/// The reply is only sent when the message was a directed request.
pub type HandlerResult = anyhow::Result<Option<Bytes>>;

/// A message as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the envelope was sent on.
    pub topic: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// Correlation id of a directed request.
    pub correlation_id: Option<u64>,
    /// Sender's timestamp.
    pub sent_at: DateTime<Utc>,
    /// Channel the envelope arrived on.
    pub origin: ChannelKind,
    /// Set when a reply sink is attached.
    expects_reply: bool,
}

impl Message {
    /// Build the handler view of `envelope`.
    #[must_use]
    pub fn new(envelope: Envelope, origin: ChannelKind, expects_reply: bool) -> Self {
        Self {
            topic: envelope.topic,
            payload: envelope.payload,
            correlation_id: envelope.correlation_id,
            sent_at: envelope.sent_at,
            origin,
            expects_reply,
        }
    }

    /// Whether a reply returned by the handler will reach the requester.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }
}

/// A subscription callback.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one message. Must not block the dispatch loop; long work should
    /// be spawned and reported back separately.
    async fn handle(&self, message: &Message) -> HandlerResult;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        (self.f)(message.clone()).await
    }
}

/// Handler that forwards messages into a bounded channel.
///
/// Forwarding never waits: when the receiver is full the message is dropped
/// and logged. Never replies.
pub struct ForwardHandler {
    tx: mpsc::Sender<Message>,
}

impl ForwardHandler {
    /// Create the handler and the receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        if let Err(e) = self.tx.try_send(message.clone()) {
            warn!(topic = %message.topic, error = %e, "Forward handler dropped message");
        }
        Ok(None)
    }
}

/// Where a directed reply goes.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Send a reply envelope back to the requester.
    async fn send_reply(&self, reply: Envelope) -> Result<(), BusError>;

    /// Address of the requester, if known.
    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

/// A decoded envelope plus where it came from.
pub struct Inbound {
    /// The decoded envelope.
    pub envelope: Envelope,
    /// Channel it arrived on.
    pub origin: ChannelKind,
    /// Route back to the requester for directed traffic.
    pub reply_to: Option<Arc<dyn ReplySink>>,
}

impl Inbound {
    /// A broadcast envelope (never answered).
    #[must_use]
    pub fn broadcast(envelope: Envelope) -> Self {
        Self {
            envelope,
            origin: ChannelKind::Multicast,
            reply_to: None,
        }
    }

    /// A directed envelope with an optional route back.
    #[must_use]
    pub fn directed(envelope: Envelope, reply_to: Option<Arc<dyn ReplySink>>) -> Self {
        Self {
            envelope,
            origin: ChannelKind::Unicast,
            reply_to,
        }
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("envelope", &self.envelope)
            .field("origin", &self.origin)
            .field("reply_to", &self.reply_to.as_ref().and_then(|sink| sink.peer()))
            .finish()
    }
}

/// Topic matcher: an exact topic, or a prefix when the pattern ends in `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// Matches exactly this topic.
    Exact(String),
    /// Matches any topic starting with this prefix (`*` alone: everything).
    Prefix(String),
}

impl TopicPattern {
    /// Parse a pattern. A single trailing `*` turns it into a prefix match.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidTopic`] for empty patterns, a `*` anywhere but the
    /// end, or patterns in the reserved `__hydra.` namespace.
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidTopic(pattern.to_string());
        if pattern.is_empty() || pattern.starts_with(RESERVED_TOPIC_PREFIX) {
            return Err(invalid());
        }
        match pattern.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => Err(invalid()),
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None if pattern.contains('*') => Err(invalid()),
            None => Ok(Self::Exact(pattern.to_string())),
        }
    }

    /// Whether `topic` matches.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == topic,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => write!(f, "{exact}"),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    handler: Arc<dyn Handler>,
}

/// What happened to one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A reply resolved a pending request.
    ResolvedReply,
    /// A reply matched no pending request and was dropped.
    DiscardedReply,
    /// Delivered to `handlers` subscriptions; `replied` if a reply was sent.
    Delivered { handlers: usize, replied: bool },
}

/// Demultiplexes envelopes to subscriptions and pending requests.
pub struct Dispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    correlation: Arc<CorrelationTable>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher resolving replies against `correlation`.
    #[must_use]
    pub fn new(correlation: Arc<CorrelationTable>) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            correlation,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. Handlers run in registration order.
    pub fn subscribe(&self, pattern: TopicPattern, handler: Arc<dyn Handler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(pattern = %pattern, subscription = id.0, "New subscription created");
        self.subscriptions.write().push(Subscription {
            id,
            pattern,
            handler,
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        let removed = subs.len() != before;
        if removed {
            debug!(subscription = id.0, "Subscription dropped");
        }
        removed
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Handlers matching `topic`, in registration order.
    fn matching(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|sub| sub.pattern.matches(topic))
            .map(|sub| Arc::clone(&sub.handler))
            .collect()
    }

    /// Route one inbound envelope.
    pub async fn dispatch(&self, inbound: Inbound) -> DispatchOutcome {
        let Inbound {
            envelope,
            origin,
            reply_to,
        } = inbound;

        if envelope.is_reply() {
            return self.resolve_reply(envelope, origin);
        }

        let handlers = self.matching(&envelope.topic);
        let reply_route = match (envelope.correlation_id, reply_to) {
            (Some(id), Some(sink)) => Some((id, sink)),
            _ => None,
        };
        let message = Message::new(envelope, origin, reply_route.is_some());

        if handlers.is_empty() {
            debug!(topic = %message.topic, ?origin, "No subscribers for topic");
        }

        let mut reply: Option<Bytes> = None;
        let mut failures: Vec<String> = Vec::new();
        for handler in &handlers {
            match AssertUnwindSafe(handler.handle(&message)).catch_unwind().await {
                Ok(Ok(Some(payload))) if message.expects_reply() && reply.is_none() => {
                    reply = Some(payload);
                }
                Ok(Ok(Some(_))) => {
                    debug!(topic = %message.topic, "Ignoring extra or unrequested reply");
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(topic = %message.topic, error = %e, "Handler failed");
                    failures.push(e.to_string());
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(topic = %message.topic, panic = %reason, "Handler panicked");
                    failures.push(format!("handler panicked: {reason}"));
                }
            }
        }

        let mut replied = false;
        if let Some((id, sink)) = reply_route {
            let envelope = match reply {
                Some(payload) => Some(Envelope::reply(id, payload)),
                None if !failures.is_empty() => Some(Envelope::error_reply(id, &failures.join("; "))),
                None => None,
            };
            if let Some(envelope) = envelope {
                replied = send_reply(sink.as_ref(), id, envelope).await;
            }
        }

        DispatchOutcome::Delivered {
            handlers: handlers.len(),
            replied,
        }
    }

    fn resolve_reply(&self, envelope: Envelope, origin: ChannelKind) -> DispatchOutcome {
        let (ChannelKind::Unicast, Some(id)) = (origin, envelope.correlation_id) else {
            debug!(topic = %envelope.topic, ?origin, "Discarding stray reply frame");
            return DispatchOutcome::DiscardedReply;
        };

        let resolved = if envelope.topic == REPLY_TOPIC {
            self.correlation.resolve(id, envelope.payload)
        } else {
            let reason = String::from_utf8_lossy(&envelope.payload).into_owned();
            self.correlation.fail(id, BusError::Remote(reason))
        };

        if resolved {
            DispatchOutcome::ResolvedReply
        } else {
            DispatchOutcome::DiscardedReply
        }
    }
}

async fn send_reply(sink: &dyn ReplySink, correlation_id: u64, reply: Envelope) -> bool {
    match sink.send_reply(reply).await {
        Ok(()) => true,
        Err(BusError::FrameTooLarge { len, max }) => {
            warn!(correlation_id, len, max, "Reply too large, sending error reply");
            let error = Envelope::error_reply(
                correlation_id,
                &format!("reply of {len} bytes exceeds frame limit {max}"),
            );
            sink.send_reply(error).await.is_ok()
        }
        Err(e) => {
            warn!(correlation_id, peer = ?sink.peer(), error = %e, "Failed to send reply");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Captures replies instead of writing them to a socket.
    #[derive(Default)]
    struct CapturingSink {
        sent: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl ReplySink for CapturingSink {
        async fn send_reply(&self, reply: Envelope) -> Result<(), BusError> {
            self.sent.lock().push(reply);
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl Handler for Exploding {
        async fn handle(&self, _message: &Message) -> HandlerResult {
            panic!("handler exploded")
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<CorrelationTable>) {
        let table = Arc::new(CorrelationTable::new());
        (Dispatcher::new(Arc::clone(&table)), table)
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Handler> {
        let log = Arc::clone(log);
        handler_fn(move |msg: Message| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}:{}", msg.topic));
                HandlerResult::Ok(None)
            }
        })
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!(
            TopicPattern::parse("cache.invalidate").unwrap(),
            TopicPattern::Exact("cache.invalidate".into())
        );
        assert_eq!(
            TopicPattern::parse("cache.*").unwrap(),
            TopicPattern::Prefix("cache.".into())
        );
        assert_eq!(TopicPattern::parse("*").unwrap(), TopicPattern::Prefix(String::new()));
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a*b").is_err());
        assert!(TopicPattern::parse("a**").is_err());
        assert!(TopicPattern::parse("__hydra.reply").is_err());
    }

    #[test]
    fn test_pattern_matching() {
        let prefix = TopicPattern::parse("cache.*").unwrap();
        assert!(prefix.matches("cache.invalidate"));
        assert!(!prefix.matches("cache"));
        assert!(!prefix.matches("mod.ban"));

        let exact = TopicPattern::parse("ping").unwrap();
        assert!(exact.matches("ping"));
        assert!(!exact.matches("ping2"));
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (dispatcher, _) = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.subscribe(TopicPattern::parse("guild.update").unwrap(), recording(&log, "first"));
        dispatcher.subscribe(TopicPattern::parse("guild.*").unwrap(), recording(&log, "second"));
        dispatcher.subscribe(TopicPattern::parse("other").unwrap(), recording(&log, "never"));

        for _ in 0..2 {
            let outcome = dispatcher
                .dispatch(Inbound::broadcast(Envelope::new("guild.update", Bytes::new())))
                .await;
            assert_eq!(
                outcome,
                DispatchOutcome::Delivered {
                    handlers: 2,
                    replied: false
                }
            );
        }

        assert_eq!(
            *log.lock(),
            vec![
                "first:guild.update",
                "second:guild.update",
                "first:guild.update",
                "second:guild.update"
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let (dispatcher, _) = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.subscribe(
            TopicPattern::parse("t").unwrap(),
            handler_fn(|_msg: Message| async { HandlerResult::Err(anyhow::anyhow!("bad payload")) }),
        );
        dispatcher.subscribe(
            TopicPattern::parse("t").unwrap(),
            Arc::new(Exploding),
        );
        dispatcher.subscribe(TopicPattern::parse("t").unwrap(), recording(&log, "survivor"));

        dispatcher
            .dispatch(Inbound::broadcast(Envelope::new("t", Bytes::new())))
            .await;
        assert_eq!(*log.lock(), vec!["survivor:t"]);
    }

    #[tokio::test]
    async fn test_directed_request_gets_first_reply() {
        let (dispatcher, _) = dispatcher();
        dispatcher.subscribe(
            TopicPattern::parse("ping").unwrap(),
            handler_fn(|_msg: Message| async { HandlerResult::Ok(Some(Bytes::from_static(b"pong"))) }),
        );
        dispatcher.subscribe(
            TopicPattern::parse("ping").unwrap(),
            handler_fn(|_msg: Message| async { HandlerResult::Ok(Some(Bytes::from_static(b"late"))) }),
        );

        let sink = Arc::new(CapturingSink::default());
        let outcome = dispatcher
            .dispatch(Inbound::directed(
                Envelope::request("ping", Bytes::new(), 42),
                Some(sink.clone() as Arc<dyn ReplySink>),
            ))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                handlers: 2,
                replied: true
            }
        );
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, REPLY_TOPIC);
        assert_eq!(sent[0].correlation_id, Some(42));
        assert_eq!(sent[0].payload, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_failed_handlers_send_error_reply() {
        let (dispatcher, _) = dispatcher();
        dispatcher.subscribe(
            TopicPattern::parse("work").unwrap(),
            handler_fn(|_msg: Message| async { HandlerResult::Err(anyhow::anyhow!("no such guild")) }),
        );

        let sink = Arc::new(CapturingSink::default());
        dispatcher
            .dispatch(Inbound::directed(
                Envelope::request("work", Bytes::new(), 7),
                Some(sink.clone() as Arc<dyn ReplySink>),
            ))
            .await;

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, crate::envelope::REPLY_ERROR_TOPIC);
        assert_eq!(&sent[0].payload[..], b"no such guild");
    }

    #[tokio::test]
    async fn test_unhandled_request_gets_no_reply() {
        let (dispatcher, _) = dispatcher();
        let sink = Arc::new(CapturingSink::default());
        let outcome = dispatcher
            .dispatch(Inbound::directed(
                Envelope::request("unregistered.topic", Bytes::new(), 1),
                Some(sink.clone() as Arc<dyn ReplySink>),
            ))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                handlers: 0,
                replied: false
            }
        );
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_and_skips_subscribers() {
        let (dispatcher, table) = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.subscribe(TopicPattern::parse("*").unwrap(), recording(&log, "all"));

        let (id, rx) = table.register("ping", Duration::from_secs(5));
        let outcome = dispatcher
            .dispatch(Inbound::directed(Envelope::reply(id, &b"pong"[..]), None))
            .await;

        assert_eq!(outcome, DispatchOutcome::ResolvedReply);
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"pong"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reply_is_discarded() {
        let (dispatcher, table) = dispatcher();
        let (id, _rx) = table.register("ping", Duration::from_secs(5));

        let outcome = dispatcher
            .dispatch(Inbound::directed(Envelope::reply(id + 99, Bytes::new()), None))
            .await;

        assert_eq!(outcome, DispatchOutcome::DiscardedReply);
        assert!(table.is_pending(id));
    }

    #[tokio::test]
    async fn test_multicast_reply_frame_is_ignored() {
        let (dispatcher, table) = dispatcher();
        let (id, _rx) = table.register("ping", Duration::from_secs(5));

        let outcome = dispatcher
            .dispatch(Inbound::broadcast(Envelope::reply(id, Bytes::new())))
            .await;

        assert_eq!(outcome, DispatchOutcome::DiscardedReply);
        assert!(table.is_pending(id));
    }

    #[tokio::test]
    async fn test_error_reply_fails_pending() {
        let (dispatcher, table) = dispatcher();
        let (id, rx) = table.register("work", Duration::from_secs(5));

        dispatcher
            .dispatch(Inbound::directed(Envelope::error_reply(id, "boom"), None))
            .await;

        assert_eq!(rx.await.unwrap(), Err(BusError::Remote("boom".into())));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (dispatcher, _) = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = dispatcher.subscribe(TopicPattern::parse("t").unwrap(), recording(&log, "h"));
        assert_eq!(dispatcher.subscription_count(), 1);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher
            .dispatch(Inbound::broadcast(Envelope::new("t", Bytes::new())))
            .await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forward_handler() {
        let (dispatcher, _) = dispatcher();
        let (handler, mut rx) = ForwardHandler::channel(4);
        dispatcher.subscribe(TopicPattern::parse("cache.*").unwrap(), handler);

        dispatcher
            .dispatch(Inbound::broadcast(Envelope::new("cache.invalidate", &b"guild:123"[..])))
            .await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "cache.invalidate");
        assert_eq!(message.payload, Bytes::from_static(b"guild:123"));
        assert_eq!(message.origin, ChannelKind::Multicast);
        assert!(!message.expects_reply());
    }
}

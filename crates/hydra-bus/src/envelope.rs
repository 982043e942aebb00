//! # Envelope Codec
//!
//! One wire frame per [`Envelope`]:
//!
//! ```text
//! ┌──────────┬────────┬──────────┬───────────┬────────────────┬─────────┬─────────┐
//! │ len: u32 │ header │ tlen:u16 │ topic     │ correlation id │ sent_at │ payload │
//! │ (BE)     │ u8     │ (BE)     │ UTF-8     │ u64 (optional) │ i64 ms  │ rest    │
//! └──────────┴────────┴──────────┴───────────┴────────────────┴─────────┴─────────┘
//! ```
//!
//! `len` counts every byte after the prefix and is bounded by the codec's
//! maximum frame length. The header's high bit flags the presence of a
//! correlation id; the low seven bits carry the protocol version.
//!
//! Decoding is total. This is the boundary between network bytes and
//! in-process data, so every malformed input maps to a [`DecodeError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BusError, DecodeError};
use crate::{PROTOCOL_VERSION, RESERVED_TOPIC_PREFIX};

/// Header bit: an 8-byte correlation id follows the topic.
const FLAG_CORRELATION: u8 = 0x80;

/// Header bits holding the protocol version.
const VERSION_MASK: u8 = 0x7F;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest possible body: header + topic length + sent_at (topic still empty).
const MIN_BODY_LEN: usize = 1 + 2 + 8;

/// Topic of a successful directed reply.
pub const REPLY_TOPIC: &str = "__hydra.reply";

/// Topic of a directed reply reporting that the serving handlers failed.
pub const REPLY_ERROR_TOPIC: &str = "__hydra.reply.error";

/// Decoded in-memory form of one wire frame.
///
/// `sent_at` travels with millisecond precision; the constructors truncate
/// to milliseconds so that a decoded envelope compares equal to the one that
/// was encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Protocol version the frame was written with.
    pub version: u8,
    /// Logical message kind used for routing.
    pub topic: String,
    /// Present only on directed request/reply traffic.
    pub correlation_id: Option<u64>,
    /// Opaque application bytes.
    pub payload: Bytes,
    /// Sender's wall clock when the envelope was built.
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an uncorrelated envelope (broadcast or fire-and-forget).
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            topic: topic.into(),
            correlation_id: None,
            payload: payload.into(),
            sent_at: now_millis(),
        }
    }

    /// Build a directed request carrying `correlation_id`.
    #[must_use]
    pub fn request(topic: impl Into<String>, payload: impl Into<Bytes>, correlation_id: u64) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(topic, payload)
        }
    }

    /// Build the reply to request `correlation_id`.
    #[must_use]
    pub fn reply(correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::request(REPLY_TOPIC, payload, correlation_id)
    }

    /// Build an error reply to request `correlation_id`.
    #[must_use]
    pub fn error_reply(correlation_id: u64, message: &str) -> Self {
        Self::request(
            REPLY_ERROR_TOPIC,
            Bytes::copy_from_slice(message.as_bytes()),
            correlation_id,
        )
    }

    /// Replace the timestamp (truncated to milliseconds).
    #[must_use]
    pub fn with_sent_at_millis(mut self, millis: i64) -> Self {
        self.sent_at = DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH);
        self
    }

    /// Whether this envelope answers a directed request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.topic == REPLY_TOPIC || self.topic == REPLY_ERROR_TOPIC
    }
}

fn now_millis() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Check a topic supplied by application code before it is sent.
///
/// # Errors
///
/// Returns [`BusError::InvalidTopic`] for empty topics, topics longer than
/// `u16::MAX` bytes, and topics in the reserved `__hydra.` namespace.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty()
        || topic.len() > usize::from(u16::MAX)
        || topic.starts_with(RESERVED_TOPIC_PREFIX)
    {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Result of reading one frame from a byte stream.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A well-formed envelope.
    Frame(Envelope),
    /// A complete frame arrived but its body was malformed. The stream is
    /// still aligned on a frame boundary.
    Malformed(DecodeError),
    /// The peer closed the stream cleanly between frames.
    Closed,
}

/// Encoder/decoder bounded by a maximum frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeCodec {
    max_frame_len: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_LEN)
    }
}

impl EnvelopeCodec {
    /// Create a codec accepting bodies of at most `max_frame_len` bytes.
    #[must_use]
    pub const fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Largest body this codec will produce or accept.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode an envelope into a complete frame (prefix included).
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidTopic`] if the topic is empty or longer than `u16::MAX`
    /// - [`BusError::FrameTooLarge`] if the body exceeds the maximum
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, BusError> {
        let mut dst = BytesMut::new();
        self.encode_into(envelope, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append an encoded frame to `dst`.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeCodec::encode`]. Nothing is written on error.
    pub fn encode_into(&self, envelope: &Envelope, dst: &mut BytesMut) -> Result<(), BusError> {
        let topic = envelope.topic.as_bytes();
        if topic.is_empty() || topic.len() > usize::from(u16::MAX) {
            return Err(BusError::InvalidTopic(envelope.topic.clone()));
        }
        let topic_len = u16::try_from(topic.len())
            .map_err(|_| BusError::InvalidTopic(envelope.topic.clone()))?;

        let correlation_len = if envelope.correlation_id.is_some() { 8 } else { 0 };
        let body_len = MIN_BODY_LEN + topic.len() + correlation_len + envelope.payload.len();
        if body_len > self.max_frame_len {
            return Err(BusError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_len,
            });
        }
        let prefix = u32::try_from(body_len).map_err(|_| BusError::FrameTooLarge {
            len: body_len,
            max: self.max_frame_len,
        })?;

        let mut header = envelope.version & VERSION_MASK;
        if envelope.correlation_id.is_some() {
            header |= FLAG_CORRELATION;
        }

        dst.reserve(LENGTH_PREFIX_LEN + body_len);
        dst.put_u32(prefix);
        dst.put_u8(header);
        dst.put_u16(topic_len);
        dst.put_slice(topic);
        if let Some(id) = envelope.correlation_id {
            dst.put_u64(id);
        }
        dst.put_i64(envelope.sent_at.timestamp_millis());
        dst.put_slice(&envelope.payload);
        Ok(())
    }

    /// Decode exactly one complete frame (prefix included).
    ///
    /// # Errors
    ///
    /// Any [`DecodeError`]; never panics.
    pub fn decode(&self, frame: &[u8]) -> Result<Envelope, DecodeError> {
        let prefix = frame.get(..LENGTH_PREFIX_LEN).ok_or(DecodeError::Truncated {
            needed: LENGTH_PREFIX_LEN,
            available: frame.len(),
        })?;
        let declared = self.body_len(prefix)?;
        let body = &frame[LENGTH_PREFIX_LEN..];
        if body.len() != declared {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        self.decode_body(body)
    }

    /// Validate a length prefix and return the body length it announces.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Truncated`] if `prefix` is shorter than four bytes,
    /// [`DecodeError::FrameTooLarge`] if the announced length exceeds the maximum.
    pub fn body_len(&self, prefix: &[u8]) -> Result<usize, DecodeError> {
        let mut prefix = prefix;
        if prefix.len() < LENGTH_PREFIX_LEN {
            return Err(DecodeError::Truncated {
                needed: LENGTH_PREFIX_LEN,
                available: prefix.len(),
            });
        }
        let len = prefix.get_u32() as usize;
        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(len)
    }

    /// Decode a frame body (everything after the length prefix).
    ///
    /// # Errors
    ///
    /// Any [`DecodeError`]; never panics.
    pub fn decode_body(&self, body: &[u8]) -> Result<Envelope, DecodeError> {
        if body.len() > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }

        let mut buf = body;
        ensure(buf, MIN_BODY_LEN)?;

        let header = buf.get_u8();
        let version = header & VERSION_MASK;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let topic_len = usize::from(buf.get_u16());
        if topic_len == 0 {
            return Err(DecodeError::EmptyTopic);
        }
        ensure(buf, topic_len)?;
        let topic = std::str::from_utf8(&buf[..topic_len])
            .map_err(|_| DecodeError::InvalidTopic)?
            .to_string();
        buf.advance(topic_len);

        let correlation_id = if header & FLAG_CORRELATION != 0 {
            ensure(buf, 8)?;
            Some(buf.get_u64())
        } else {
            None
        };

        ensure(buf, 8)?;
        let millis = buf.get_i64();
        let sent_at = DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH);

        Ok(Envelope {
            version,
            topic,
            correlation_id,
            payload: Bytes::copy_from_slice(buf),
            sent_at,
        })
    }

    /// Read one frame from a byte stream.
    ///
    /// # Errors
    ///
    /// - [`BusError::Transport`] on I/O failure or EOF in the middle of a frame
    /// - [`BusError::Decode`] when the length prefix is over the maximum; the
    ///   stream cannot be realigned and the caller should drop it
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<ReadOutcome, BusError>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(ReadOutcome::Closed)
            }
            Err(e) => return Err(BusError::transport("read", e)),
        }

        let len = self.body_len(&prefix)?;
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| BusError::transport("read", e))?;

        Ok(match self.decode_body(&body) {
            Ok(envelope) => ReadOutcome::Frame(envelope),
            Err(e) => ReadOutcome::Malformed(e),
        })
    }

    /// Encode and write one frame to a byte stream.
    ///
    /// # Errors
    ///
    /// Encoding errors, or [`BusError::Transport`] if the write fails.
    pub async fn write_frame<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<(), BusError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(envelope)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| BusError::transport("write", e))?;
        writer
            .flush()
            .await
            .map_err(|e| BusError::transport("flush", e))
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

//! Message frames forwarded between nodes over transport unicast.
//!
//! A frame is a packed sequence of already-routed broker messages.
//! Format, big-endian: `count u32` followed by, per message,
//! `id_len u16 | id | channel_len u16 | channel | ttl u32 | payload_len u32 | payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, SwarmError};

/// A routed broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message identifier, including the routing ssid.
    pub id: Bytes,
    /// Channel the message was published on.
    pub channel: Bytes,
    /// Opaque message body.
    pub payload: Bytes,
    /// Time-to-live in seconds, zero for none.
    pub ttl: u32,
}

impl Message {
    /// Creates a message without a TTL.
    #[must_use]
    pub fn new(id: impl Into<Bytes>, channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            payload: payload.into(),
            ttl: 0,
        }
    }

    /// Sets the TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Checks that every field fits its length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::FieldTooLong`] for an id or channel longer than
    /// `u16::MAX` bytes or a payload longer than `u32::MAX` bytes.
    pub fn validate(&self) -> Result<(), SwarmError> {
        check_len("id", self.id.len(), usize::from(u16::MAX))?;
        check_len("channel", self.channel.len(), usize::from(u16::MAX))?;
        check_len("payload", self.payload.len(), u32::MAX as usize)
    }

    fn encoded_len(&self) -> usize {
        2 + self.id.len() + 2 + self.channel.len() + 4 + 4 + self.payload.len()
    }
}

/// A batch of messages sent to one peer in a single unicast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    messages: Vec<Message>,
}

impl Frame {
    /// Creates an empty frame.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Appends a message.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the frame holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the messages.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Encodes the frame.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::FieldTooLong`] if any message fails
    /// [`Message::validate`]; nothing is encoded.
    pub fn encode(&self) -> Result<Bytes, SwarmError> {
        for message in &self.messages {
            message.validate()?;
        }

        let body: usize = self.messages.iter().map(Message::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(4 + body);
        buf.put_u32(self.messages.len() as u32);
        for message in &self.messages {
            buf.put_u16(message.id.len() as u16);
            buf.put_slice(&message.id);
            buf.put_u16(message.channel.len() as u16);
            buf.put_slice(&message.channel);
            buf.put_u32(message.ttl);
            buf.put_u32(message.payload.len() as u32);
            buf.put_slice(&message.payload);
        }
        Ok(buf.freeze())
    }

    /// Decodes a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated or followed by extra bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Bytes::copy_from_slice(buf);
        let count = get_u32(&mut reader)?;

        let mut messages = Vec::new();
        for _ in 0..count {
            let id = get_short(&mut reader)?;
            let channel = get_short(&mut reader)?;
            let ttl = get_u32(&mut reader)?;
            let payload_len = get_u32(&mut reader)? as usize;
            let payload = take(&mut reader, payload_len)?;
            messages.push(Message {
                id,
                channel,
                payload,
                ttl,
            });
        }

        if reader.has_remaining() {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }
        Ok(Self { messages })
    }
}

impl FromIterator<Message> for Frame {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Frame {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), SwarmError> {
    if len > max {
        return Err(SwarmError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn get_u32(reader: &mut Bytes) -> Result<u32, DecodeError> {
    if reader.remaining() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            remaining: reader.remaining(),
        });
    }
    Ok(reader.get_u32())
}

fn get_short(reader: &mut Bytes) -> Result<Bytes, DecodeError> {
    if reader.remaining() < 2 {
        return Err(DecodeError::Truncated {
            needed: 2,
            remaining: reader.remaining(),
        });
    }
    let len = usize::from(reader.get_u16());
    take(reader, len)
}

fn take(reader: &mut Bytes, len: usize) -> Result<Bytes, DecodeError> {
    if reader.remaining() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            remaining: reader.remaining(),
        });
    }
    Ok(reader.split_to(len))
}

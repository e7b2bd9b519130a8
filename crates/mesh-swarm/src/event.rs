//! Subscription events and their flat key encoding.
//!
//! An event key is the fixed-layout, big-endian concatenation
//! `peer (u64) | conn (u64) | ssid parts (u32 each)`. The two leading fields
//! are fixed width, so the remainder determines the ssid exactly and distinct
//! events never share a key.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::name::PeerName;

const HEADER_LEN: usize = 16;
const PART_LEN: usize = 4;

/// Identifier of a subscriber connection local to the node that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription identifier: the parsed form of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ssid(Vec<u32>);

impl Ssid {
    /// Largest number of parts whose event key still fits a `u16` length
    /// prefix in the state layout.
    pub const MAX_PARTS: usize = (u16::MAX as usize - HEADER_LEN) / PART_LEN;

    /// Creates an ssid from its parts.
    #[must_use]
    pub fn new(parts: impl Into<Vec<u32>>) -> Self {
        Self(parts.into())
    }

    /// Returns the parts of the ssid.
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// Returns the number of parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the ssid has no parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Encoded [`SubscriptionEvent`], used as the element of the subscription set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey(Bytes);

impl EventKey {
    /// Wraps already-encoded bytes. The bytes are validated on decode.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the event this key identifies.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid event encoding.
    pub fn decode(&self) -> Result<SubscriptionEvent, DecodeError> {
        SubscriptionEvent::decode(&self.0)
    }
}

/// Identity of a single subscribe or unsubscribe operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionEvent {
    /// Node owning the subscriber.
    pub peer: PeerName,
    /// Subscriber connection on that node.
    pub conn: ConnectionId,
    /// Subscribed topic.
    pub ssid: Ssid,
}

impl SubscriptionEvent {
    /// Creates a new event.
    #[must_use]
    pub const fn new(peer: PeerName, conn: ConnectionId, ssid: Ssid) -> Self {
        Self { peer, conn, ssid }
    }

    /// Encodes the event into its key.
    #[must_use]
    pub fn encode(&self) -> EventKey {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + PART_LEN * self.ssid.len());
        buf.put_u64(self.peer.as_u64());
        buf.put_u64(self.conn.0);
        for part in self.ssid.as_slice() {
            buf.put_u32(*part);
        }
        EventKey(buf.freeze())
    }

    /// Decodes an event from its key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is shorter than the fixed header, the
    /// ssid section is not a whole number of parts or the peer does not fit
    /// in 48 bits.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                remaining: bytes.len(),
            });
        }
        if (bytes.len() - HEADER_LEN) % PART_LEN != 0 {
            return Err(DecodeError::InvalidKeyLength(bytes.len()));
        }

        let raw = bytes.get_u64();
        let peer = PeerName::try_new(raw).ok_or(DecodeError::InvalidPeerName(raw))?;
        let conn = ConnectionId(bytes.get_u64());
        let mut parts = Vec::with_capacity(bytes.len() / PART_LEN);
        while bytes.has_remaining() {
            parts.push(bytes.get_u32());
        }

        Ok(Self {
            peer,
            conn,
            ssid: Ssid(parts),
        })
    }
}

impl From<&SubscriptionEvent> for EventKey {
    fn from(event: &SubscriptionEvent) -> Self {
        event.encode()
    }
}

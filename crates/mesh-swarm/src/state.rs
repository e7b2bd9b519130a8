//! Replicated subscription state.
//!
//! [`SubscriptionState`] is a last-writer-wins element set over [`EventKey`]s.
//! Every key carries a [`Marker`] made of a stamp and a kind. Markers are
//! totally ordered by stamp, then `Removed` over `Added`, and a key always
//! resolves to the greatest marker seen for it. Merging is therefore a
//! per-key maximum: commutative, associative and idempotent.
//!
//! Stamps come from a hybrid clock: wall-clock nanoseconds, bumped past the
//! last issued stamp and past every stamp observed through a merge. Only the
//! originating node issues operations on its own keys, so its latest
//! operation always carries the greatest stamp for that key.
//!
//! Removal writes a tombstone and keys are never deleted, so a late add from
//! a slow replica cannot resurrect a removed subscription.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::event::EventKey;

/// Current state payload version.
pub const STATE_VERSION: u8 = 1;

const KIND_ADDED: u8 = 0;
const KIND_REMOVED: u8 = 1;

/// Whether a key was last added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerKind {
    /// The subscription exists.
    Added,
    /// The subscription was removed (tombstone).
    Removed,
}

/// Resolved value of a key in the subscription state.
///
/// Field order matters: the derived ordering compares `stamp` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Marker {
    stamp: u64,
    kind: MarkerKind,
}

impl Marker {
    /// Creates an added marker.
    #[must_use]
    pub const fn added(stamp: u64) -> Self {
        Self {
            stamp,
            kind: MarkerKind::Added,
        }
    }

    /// Creates a removed marker.
    #[must_use]
    pub const fn removed(stamp: u64) -> Self {
        Self {
            stamp,
            kind: MarkerKind::Removed,
        }
    }

    /// Returns the stamp of the operation.
    #[must_use]
    pub const fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Returns the kind of the operation.
    #[must_use]
    pub const fn kind(&self) -> MarkerKind {
        self.kind
    }

    /// Returns true if the key is added.
    #[must_use]
    pub const fn is_added(&self) -> bool {
        matches!(self.kind, MarkerKind::Added)
    }

    /// Returns true if the key is removed.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self.kind, MarkerKind::Removed)
    }
}

/// Mergeable set of subscription operations.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    entries: BTreeMap<EventKey, Marker>,
    clock: u64,
}

impl PartialEq for SubscriptionState {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for SubscriptionState {}

impl SubscriptionState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state holding a single operation.
    #[must_use]
    pub fn single(key: EventKey, marker: Marker) -> Self {
        let mut state = Self::new();
        state.clock = marker.stamp;
        state.entries.insert(key, marker);
        state
    }

    /// Marks `key` as added and returns the marker written.
    pub fn add(&mut self, key: EventKey) -> Marker {
        self.apply(key, MarkerKind::Added)
    }

    /// Writes a tombstone for `key` and returns the marker written.
    pub fn remove(&mut self, key: EventKey) -> Marker {
        self.apply(key, MarkerKind::Removed)
    }

    fn apply(&mut self, key: EventKey, kind: MarkerKind) -> Marker {
        let floor = self.entries.get(&key).map_or(0, Marker::stamp);
        let marker = Marker {
            stamp: self.tick(floor),
            kind,
        };
        self.entries.insert(key, marker);
        marker
    }

    /// Issues a stamp greater than the last issued one, every observed one
    /// and `floor`.
    fn tick(&mut self, floor: u64) -> u64 {
        let stamp = wall_clock_nanos()
            .max(self.clock.saturating_add(1))
            .max(floor.saturating_add(1));
        self.clock = stamp;
        stamp
    }

    /// Merges `other` into this state and returns the delta: the entries of
    /// `other` that were new information here.
    pub fn merge(&mut self, other: &Self) -> Self {
        let mut delta = Self::new();
        for (key, theirs) in &other.entries {
            self.clock = self.clock.max(theirs.stamp);
            delta.clock = delta.clock.max(theirs.stamp);

            match self.entries.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    if *e.get() >= *theirs {
                        continue;
                    }
                    e.insert(*theirs);
                }
                Entry::Vacant(e) => {
                    e.insert(*theirs);
                }
            }
            delta.entries.insert(key.clone(), *theirs);
        }
        delta
    }

    /// Returns the marker for `key`, if known.
    #[must_use]
    pub fn get(&self, key: &EventKey) -> Option<Marker> {
        self.entries.get(key).copied()
    }

    /// Returns every known key with its resolved marker.
    #[must_use]
    pub const fn all(&self) -> &BTreeMap<EventKey, Marker> {
        &self.entries
    }

    /// Iterates over every key and marker in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&EventKey, &Marker)> {
        self.entries.iter()
    }

    /// Returns the number of keys, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the state holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes the state for gossip.
    ///
    /// Layout, big-endian: `version u8 | count u32 | count x (key_len u16 |
    /// key | stamp u64 | kind u8)`.
    ///
    /// Keys must fit the `u16` length prefix; event keys built from an ssid of
    /// at most [`Ssid::MAX_PARTS`](crate::event::Ssid::MAX_PARTS) parts always do.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let body: usize = self.entries.keys().map(|k| 2 + k.len() + 9).sum();
        let mut buf = BytesMut::with_capacity(5 + body);
        buf.put_u8(STATE_VERSION);
        buf.put_u32(self.entries.len() as u32);
        for (key, marker) in &self.entries {
            buf.put_u16(key.len() as u16);
            buf.put_slice(key.as_bytes());
            buf.put_u64(marker.stamp);
            buf.put_u8(match marker.kind {
                MarkerKind::Added => KIND_ADDED,
                MarkerKind::Removed => KIND_REMOVED,
            });
        }
        buf.freeze()
    }

    /// Decodes a gossip payload. Nothing is returned unless the whole
    /// payload is valid.
    ///
    /// # Errors
    ///
    /// Returns an error on an unknown version, truncation, an unknown marker
    /// kind, a repeated key or trailing bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        ensure(buf, 5)?;
        let version = buf.get_u8();
        if version != STATE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let count = buf.get_u32();
        let mut state = Self::new();
        for _ in 0..count {
            ensure(buf, 2)?;
            let key_len = usize::from(buf.get_u16());
            ensure(buf, key_len + 9)?;
            let key = EventKey::from_bytes(Bytes::copy_from_slice(&buf[..key_len]));
            buf.advance(key_len);

            let stamp = buf.get_u64();
            let kind = match buf.get_u8() {
                KIND_ADDED => MarkerKind::Added,
                KIND_REMOVED => MarkerKind::Removed,
                other => return Err(DecodeError::InvalidMarker(other)),
            };

            if state.entries.insert(key, Marker { stamp, kind }).is_some() {
                return Err(DecodeError::DuplicateKey);
            }
            state.clock = state.clock.max(stamp);
        }

        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(state)
    }
}

impl FromIterator<(EventKey, Marker)> for SubscriptionState {
    /// Builds a state, keeping the greatest marker for repeated keys.
    fn from_iter<I: IntoIterator<Item = (EventKey, Marker)>>(iter: I) -> Self {
        let mut state = Self::new();
        for (key, marker) in iter {
            state.merge(&Self::single(key, marker));
        }
        state
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

//! Remote peers and the registry that owns them.
//!
//! A [`Peer`] is the local view of a remote node: which of its subscriptions
//! have already been reported to the broker, when it was last seen alive,
//! and the messages queued for it. The [`PeerRegistry`] guarantees a single
//! live `Peer` per [`PeerName`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::event::{ConnectionId, Ssid, SubscriptionEvent};
use crate::frame::{Frame, Message};
use crate::name::PeerName;

#[derive(Debug, Default)]
struct PeerInner {
    /// Subscriptions already reported to the broker.
    subscriptions: HashSet<SubscriptionEvent>,
    /// Messages waiting for the next flush.
    outbox: Frame,
    closed: bool,
}

/// Local proxy for a remote cluster node.
#[derive(Debug)]
pub struct Peer {
    name: PeerName,
    last_active: Mutex<Instant>,
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// Creates a peer, marked active as of now.
    #[must_use]
    pub fn new(name: PeerName) -> Self {
        Self {
            name,
            last_active: Mutex::new(Instant::now()),
            inner: Mutex::new(PeerInner::default()),
        }
    }

    /// Returns the peer's name.
    #[must_use]
    pub const fn name(&self) -> PeerName {
        self.name
    }

    /// Returns the peer's numeric identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.name.as_u64()
    }

    /// Records that the peer is alive.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Returns when the peer was last touched.
    #[must_use]
    pub fn last_active_at(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Returns true if the peer was touched at or after `since`, the start of
    /// the most recent liveness sweep.
    #[must_use]
    pub fn is_active(&self, since: Instant) -> bool {
        *self.last_active.lock() >= since
    }

    /// Records a subscription for this peer. Returns true only the first time
    /// the (connection, ssid) pair is seen, and never once closed.
    pub fn on_subscribe(&self, event: &SubscriptionEvent) -> bool {
        let mut inner = self.inner.lock();
        !inner.closed && inner.subscriptions.insert(event.clone())
    }

    /// Forgets a subscription. Returns true only if it was known, and never
    /// once closed.
    pub fn on_unsubscribe(&self, event: &SubscriptionEvent) -> bool {
        let mut inner = self.inner.lock();
        !inner.closed && inner.subscriptions.remove(event)
    }

    /// Returns every known (connection, ssid) pair.
    #[must_use]
    pub fn all(&self) -> Vec<(ConnectionId, Ssid)> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .map(|e| (e.conn, e.ssid.clone()))
            .collect()
    }

    /// Queues a message for delivery on the next flush. Returns false if the
    /// peer is closed or the message cannot be framed.
    pub fn send(&self, message: Message) -> bool {
        if let Err(e) = message.validate() {
            warn!(peer = %self.name, error = %e, "dropping unframeable message");
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.outbox.push(message);
        true
    }

    /// Takes the queued messages, if any.
    #[must_use]
    pub fn take_frame(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if inner.outbox.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut inner.outbox))
        }
    }

    /// Closes the peer, dropping queued messages. Returns true for the call
    /// that actually closed it.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        let dropped = inner.outbox.len();
        inner.outbox = Frame::new();
        debug!(peer = %self.name, dropped, "peer closed");
        true
    }

    /// Returns true once the peer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Concurrent map of remote peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerName, Arc<Peer>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live peer for `name`, creating it if needed. Concurrent
    /// callers always observe the same instance; a closed peer is replaced.
    pub fn get_or_create(&self, name: PeerName) -> Arc<Peer> {
        if let Some(peer) = self
            .peers
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|peer| !peer.is_closed())
        {
            return peer;
        }

        match self.peers.entry(name) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                let peer = Arc::new(Peer::new(name));
                entry.insert(Arc::clone(&peer));
                info!(peer = %name, "peer recreated");
                peer
            }
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let peer = Arc::new(Peer::new(name));
                entry.insert(Arc::clone(&peer));
                info!(peer = %name, "peer created");
                peer
            }
        }
    }

    /// Returns the registered peer for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &PeerName) -> Option<Arc<Peer>> {
        self.peers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Unregisters `peer`, but only if it is still the registered instance.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        self.peers
            .remove_if(&peer.name(), |_, current| Arc::ptr_eq(current, peer))
            .is_some()
    }

    /// Returns a snapshot of every registered peer.
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    fn event(peer: u64, conn: u64, topic: u32) -> SubscriptionEvent {
        SubscriptionEvent::new(PeerName::new(peer), ConnectionId(conn), Ssid::new([topic]))
    }

    // ========== Peer Tests ==========

    #[test]
    fn on_subscribe_is_true_once() {
        let peer = Peer::new(PeerName::new(2));
        assert!(peer.on_subscribe(&event(2, 7, 1)));
        assert!(!peer.on_subscribe(&event(2, 7, 1)));
        assert!(peer.on_subscribe(&event(2, 8, 1)));
        assert_eq!(peer.all().len(), 2);
    }

    #[test]
    fn on_unsubscribe_requires_known_pair() {
        let peer = Peer::new(PeerName::new(2));
        assert!(!peer.on_unsubscribe(&event(2, 7, 1)));
        peer.on_subscribe(&event(2, 7, 1));
        assert!(peer.on_unsubscribe(&event(2, 7, 1)));
        assert!(!peer.on_unsubscribe(&event(2, 7, 1)));
        assert!(peer.all().is_empty());
    }

    #[test]
    fn all_lists_connection_and_ssid() {
        let peer = Peer::new(PeerName::new(2));
        peer.on_subscribe(&event(2, 7, 42));
        assert_eq!(peer.all(), vec![(ConnectionId(7), Ssid::new([42]))]);
    }

    #[test]
    fn touch_marks_active_since_sweep() {
        let peer = Peer::new(PeerName::new(2));
        std::thread::sleep(Duration::from_millis(2));
        let sweep = Instant::now();
        assert!(!peer.is_active(sweep));
        peer.touch();
        assert!(peer.is_active(sweep));
        assert!(peer.last_active_at() >= sweep);
    }

    #[test]
    fn close_is_idempotent() {
        let peer = Peer::new(PeerName::new(2));
        assert!(peer.close());
        assert!(!peer.close());
        assert!(peer.is_closed());
    }

    #[test]
    fn closed_peer_rejects_changes_but_keeps_subscriptions() {
        let peer = Peer::new(PeerName::new(2));
        peer.on_subscribe(&event(2, 7, 1));
        peer.close();
        assert!(!peer.on_subscribe(&event(2, 8, 1)));
        assert!(!peer.on_unsubscribe(&event(2, 7, 1)));
        assert_eq!(peer.all().len(), 1);
    }

    #[test]
    fn send_queues_until_taken() {
        let peer = Peer::new(PeerName::new(2));
        assert!(peer.take_frame().is_none());
        assert!(peer.send(Message::new(&b"1"[..], &b"a/"[..], &b"x"[..])));
        assert!(peer.send(Message::new(&b"2"[..], &b"a/"[..], &b"y"[..])));
        let frame = peer.take_frame().expect("queued messages");
        assert_eq!(frame.len(), 2);
        assert!(peer.take_frame().is_none());
    }

    #[test]
    fn send_rejects_oversized_channel() {
        let peer = Peer::new(PeerName::new(2));
        let channel = vec![b'c'; usize::from(u16::MAX) + 1];
        assert!(!peer.send(Message::new(&b"1"[..], channel, &b"x"[..])));
        assert!(peer.send(Message::new(&b"2"[..], &b"a/"[..], &b"y"[..])));
        assert_eq!(peer.take_frame().expect("queued").len(), 1);
    }

    #[test]
    fn close_drops_outbox_and_rejects_send() {
        let peer = Peer::new(PeerName::new(2));
        peer.send(Message::new(&b"1"[..], &b"a/"[..], &b"x"[..]));
        peer.close();
        assert!(peer.take_frame().is_none());
        assert!(!peer.send(Message::new(&b"2"[..], &b"a/"[..], &b"y"[..])));
    }

    // ========== PeerRegistry Tests ==========

    #[test]
    fn get_or_create_returns_same_instance() {
        let registry = PeerRegistry::new();
        let a = registry.get_or_create(PeerName::new(5));
        let b = registry.get_or_create(PeerName::new(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_get_or_create_single_instance() {
        const THREADS: usize = 16;
        let registry = PeerRegistry::new();
        let barrier = Barrier::new(THREADS);

        let peers: Vec<Arc<Peer>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry.get_or_create(PeerName::new(99))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread panicked"))
                .collect()
        });

        assert!(peers.iter().all(|p| Arc::ptr_eq(p, &peers[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_peer_is_replaced_on_lookup() {
        let registry = PeerRegistry::new();
        let old = registry.get_or_create(PeerName::new(5));
        old.close();

        let new = registry.get_or_create(PeerName::new(5));
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!new.is_closed());
    }

    #[test]
    fn remove_checks_identity() {
        let registry = PeerRegistry::new();
        let old = registry.get_or_create(PeerName::new(5));
        old.close();
        let new = registry.get_or_create(PeerName::new(5));

        assert!(!registry.remove(&old));
        assert!(registry.get(&PeerName::new(5)).is_some());
        assert!(registry.remove(&new));
        assert!(registry.is_empty());
    }
}

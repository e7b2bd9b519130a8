//! Swarm orchestration.
//!
//! The [`Swarm`] owns the replicated subscription state and the peer
//! registry, and ties them to the transport and the broker:
//! - local subscribe/unsubscribe notifications become state operations and
//!   one-operation broadcasts
//! - incoming gossip is merged and replayed against the per-peer views,
//!   producing broker callbacks
//! - a periodic sweep keeps the mesh connected and evicts departed peers
//! - a short flush timer forwards queued messages to their peers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::address;
use crate::config::SwarmConfig;
use crate::error::{DecodeError, SwarmError};
use crate::event::{ConnectionId, EventKey, Ssid, SubscriptionEvent};
use crate::frame::{Frame, Message};
use crate::name::PeerName;
use crate::peer::{Peer, PeerRegistry};
use crate::state::{Marker, MarkerKind, SubscriptionState};
use crate::transport::{Gossiper, Transport, TransportConfig, TransportFactory};

/// Broker-side callbacks invoked by the swarm.
///
/// Calls may arrive from transport worker threads and from the swarm's own
/// loops; implementations must not call back into the swarm's gossip entry
/// points.
pub trait ClusterHandler: Send + Sync {
    /// A remote peer gained a subscriber for `ssid`.
    fn on_subscribe(&self, ssid: &Ssid, peer: &Arc<Peer>);

    /// A remote peer lost a subscriber for `ssid`, or went offline.
    fn on_unsubscribe(&self, ssid: &Ssid, peer: &Arc<Peer>);

    /// A message was forwarded to this node.
    fn on_message(&self, message: Message);
}

/// Cluster subscription gossiper for one broker node.
pub struct Swarm {
    /// Local node name.
    name: PeerName,
    /// Configuration.
    config: SwarmConfig,
    /// Replicated subscription state; also serializes merge dispatch.
    state: Mutex<SubscriptionState>,
    /// Remote peers.
    members: PeerRegistry,
    /// Gossip transport.
    transport: Arc<dyn Transport>,
    /// Broker callbacks.
    handler: Arc<dyn ClusterHandler>,
    /// Stops the swarm's loops.
    shutdown: CancellationToken,
    listening: AtomicBool,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl Swarm {
    /// Creates a swarm and its transport.
    ///
    /// The swarm's loops stop when `shutdown` (or [`Swarm::close`]) fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, an address cannot
    /// be resolved or the transport cannot be built. Callers should treat
    /// any of these as fatal.
    pub fn new<F>(
        config: SwarmConfig,
        handler: Arc<dyn ClusterHandler>,
        factory: &F,
        shutdown: &CancellationToken,
    ) -> Result<Arc<Self>, SwarmError>
    where
        F: TransportFactory + ?Sized,
    {
        config.validate()?;

        let listen = address::resolve(&config.listen_addr)?;
        let advertise = address::resolve(&config.advertise_addr)?;
        let name = PeerName::local(config.node_name.as_deref());
        info!(name = %name, listen = %listen, advertise = %advertise, "initializing swarm");

        let transport = factory.build(TransportConfig {
            name,
            listen,
            advertise,
            passphrase: config.passphrase.clone(),
            conn_limit: config.conn_limit,
        })?;

        let swarm = Arc::new(Self {
            name,
            config,
            state: Mutex::new(SubscriptionState::new()),
            members: PeerRegistry::new(),
            transport,
            handler,
            shutdown: shutdown.child_token(),
            listening: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&swarm);
        let gossiper: Weak<dyn Gossiper> = weak;
        swarm.transport.attach(gossiper);

        Ok(swarm)
    }

    /// Returns the local node name.
    #[must_use]
    pub const fn name(&self) -> PeerName {
        self.name
    }

    /// Returns the local node identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.name.as_u64()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Starts the transport, then the reinforcement and flush loops.
    ///
    /// Must be called from within a Tokio runtime. If the transport fails to
    /// start no loop is spawned and `listen` may be retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the swarm is already listening or closed, or if
    /// the transport fails to start.
    pub fn listen(self: &Arc<Self>) -> Result<(), SwarmError> {
        if self.shutdown.is_cancelled() {
            return Err(SwarmError::Transport("swarm is closed".to_string()));
        }
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(SwarmError::Transport("swarm is already listening".to_string()));
        }

        if let Err(e) = self.transport.start() {
            self.listening.store(false, Ordering::Release);
            error!(name = %self.name, error = %e, "failed to start transport");
            return Err(e);
        }

        info!(
            name = %self.name,
            reinforce_secs = self.config.reinforce_interval_secs,
            "swarm listening"
        );
        tokio::spawn(Arc::clone(self).reinforce_loop());
        tokio::spawn(Arc::clone(self).flush_loop());
        Ok(())
    }

    async fn reinforce_loop(self: Arc<Self>) {
        let period = self.config.reinforce_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.update(),
                () = self.shutdown.cancelled() => break,
            }
        }
        debug!(name = %self.name, "reinforcement loop stopped");
    }

    async fn flush_loop(self: Arc<Self>) {
        let period = self.config.flush_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush(),
                () = self.shutdown.cancelled() => break,
            }
        }
        debug!(name = %self.name, "flush loop stopped");
    }

    /// Runs one reinforcement pass: touches every live peer, rejoins poorly
    /// connected ones and evicts peers that were not touched.
    pub fn update(&self) {
        let sweep = Instant::now();
        let descriptions = self.transport.descriptions();
        let expected = descriptions.len().saturating_sub(1);

        for desc in descriptions
            .iter()
            .filter(|d| !d.is_self && d.name != self.name)
        {
            // Liveness follows the transport's view, not message traffic.
            self.find_peer(desc.name).touch();

            if desc.num_connections < expected {
                let addr = desc.join_address();
                debug!(peer = %desc.name, addr, connections = desc.num_connections, expected, "reinforcing peer");
                if let Some(Err(e)) = self.join(&[addr]).pop() {
                    warn!(peer = %desc.name, addr, error = %e, "failed to rejoin peer");
                }
            }
        }

        for peer in self.members.peers() {
            if !peer.is_active(sweep) {
                self.on_peer_offline(&peer);
            }
        }
    }

    /// Retracts every subscription of a departed peer, exactly once.
    fn on_peer_offline(&self, peer: &Arc<Peer>) {
        if !peer.close() {
            return;
        }
        self.members.remove(peer);

        let subscriptions = peer.all();
        info!(peer = %peer.name(), subscriptions = subscriptions.len(), "peer removed");
        for (_, ssid) in &subscriptions {
            self.handler.on_unsubscribe(ssid, peer);
        }
    }

    /// Sends every queued frame to its peer.
    pub fn flush(&self) {
        for peer in self.members.peers() {
            let Some(frame) = peer.take_frame() else {
                continue;
            };
            let sent = frame
                .encode()
                .and_then(|payload| self.transport.unicast(peer.name(), payload));
            if let Err(e) = sent {
                warn!(peer = %peer.name(), messages = frame.len(), error = %e, "failed to forward frame");
            }
        }
    }

    /// Returns the peer for `name`, creating it if needed.
    pub fn find_peer(&self, name: PeerName) -> Arc<Peer> {
        self.members.get_or_create(name)
    }

    /// Returns the number of registered remote peers.
    #[must_use]
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Returns the number of connections the transport reports for this node.
    #[must_use]
    pub fn num_peers(&self) -> usize {
        self.transport
            .descriptions()
            .iter()
            .find(|d| d.is_self)
            .map_or(0, |d| d.num_connections)
    }

    /// Initiates connections to `addrs`, one result per address in order.
    pub fn join<S: AsRef<str>>(&self, addrs: &[S]) -> Vec<Result<(), SwarmError>> {
        addrs
            .iter()
            .map(|addr| -> Result<(), SwarmError> {
                let addr = addr.as_ref();
                address::validate_peer(addr)?;
                self.transport.connect(addr)
            })
            .collect()
    }

    /// Records a local subscription and broadcasts it.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::SsidTooLong`] if the ssid has more than
    /// [`Ssid::MAX_PARTS`] parts; nothing is recorded.
    pub fn notify_subscribe(&self, conn: ConnectionId, ssid: Ssid) -> Result<(), SwarmError> {
        self.notify(conn, ssid, MarkerKind::Added)
    }

    /// Records a local unsubscription and broadcasts it.
    ///
    /// # Errors
    ///
    /// Returns [`SwarmError::SsidTooLong`] if the ssid has more than
    /// [`Ssid::MAX_PARTS`] parts; nothing is recorded.
    pub fn notify_unsubscribe(&self, conn: ConnectionId, ssid: Ssid) -> Result<(), SwarmError> {
        self.notify(conn, ssid, MarkerKind::Removed)
    }

    fn notify(&self, conn: ConnectionId, ssid: Ssid, kind: MarkerKind) -> Result<(), SwarmError> {
        if ssid.len() > Ssid::MAX_PARTS {
            return Err(SwarmError::SsidTooLong {
                parts: ssid.len(),
                max: Ssid::MAX_PARTS,
            });
        }

        let key = SubscriptionEvent::new(self.name, conn, ssid).encode();
        let marker = {
            let mut state = self.state.lock();
            match kind {
                MarkerKind::Added => state.add(key.clone()),
                MarkerKind::Removed => state.remove(key.clone()),
            }
        };
        debug!(conn = %conn, stamp = marker.stamp(), kind = ?kind, "local subscription change");
        self.transport
            .broadcast(SubscriptionState::single(key, marker).encode());
        Ok(())
    }

    /// Decodes and merges a state payload, then replays it against the peers.
    fn merge(&self, buf: &[u8]) -> Result<Option<SubscriptionState>, SwarmError> {
        let other = SubscriptionState::decode(buf)?;
        let events = other
            .iter()
            .map(|(key, _)| key.decode().map(|event| (key.clone(), event)))
            .collect::<Result<Vec<(EventKey, SubscriptionEvent)>, DecodeError>>()?;

        let mut state = self.state.lock();
        let delta = state.merge(&other);

        // Every received operation is replayed, not only the delta: the peer
        // may have been recreated since the operation was first merged.
        for (key, event) in &events {
            if event.peer == self.name {
                continue;
            }
            if let Some(marker) = state.get(key) {
                self.dispatch(event, marker);
            }
        }
        drop(state);

        debug!(received = other.len(), new = delta.len(), "merged gossip");
        Ok((!delta.is_empty()).then_some(delta))
    }

    /// Applies one resolved operation to its peer and notifies the broker
    /// if the peer's view changed.
    fn dispatch(&self, event: &SubscriptionEvent, marker: Marker) {
        loop {
            let peer = self.find_peer(event.peer);
            let changed = if marker.is_added() {
                peer.on_subscribe(event)
            } else {
                peer.on_unsubscribe(event)
            };

            if changed {
                if marker.is_added() {
                    self.handler.on_subscribe(&event.ssid, &peer);
                } else {
                    self.handler.on_unsubscribe(&event.ssid, &peer);
                }
                return;
            }

            // Evicted between lookup and update: retry on its replacement.
            if !peer.is_closed() {
                return;
            }
        }
    }

    /// Stops the loops, closes every peer and stops the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if it fails to stop.
    pub fn close(&self) -> Result<(), SwarmError> {
        self.shutdown.cancel();
        for peer in self.members.peers() {
            peer.close();
        }
        info!(name = %self.name, "swarm closed");
        self.transport.stop()
    }
}

impl Gossiper for Swarm {
    fn gossip(&self) -> SubscriptionState {
        self.state.lock().clone()
    }

    fn on_gossip(&self, buf: &[u8]) -> Result<Option<SubscriptionState>, SwarmError> {
        // Empty periodic exchanges carry no state.
        if buf.len() <= 1 {
            return Ok(None);
        }

        self.merge(buf)
            .inspect_err(|e| error!(error = %e, "failed to merge gossip"))
    }

    fn on_gossip_broadcast(
        &self,
        src: PeerName,
        buf: &[u8],
    ) -> Result<Option<SubscriptionState>, SwarmError> {
        self.merge(buf)
            .inspect_err(|e| error!(src = %src, error = %e, "failed to merge broadcast"))
    }

    fn on_gossip_unicast(&self, src: PeerName, buf: &[u8]) -> Result<(), SwarmError> {
        let frame = Frame::decode(buf)
            .inspect_err(|e| error!(src = %src, error = %e, "failed to decode frame"))?;

        debug!(src = %src, messages = frame.len(), "received frame");
        for message in frame {
            self.handler.on_message(message);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "swarm_tests.rs"]
mod tests;

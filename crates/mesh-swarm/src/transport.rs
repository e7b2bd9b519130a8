//! Contract between the swarm and the gossip transport.
//!
//! The transport owns peer discovery, connections and delivery. It calls
//! back into the swarm through [`Gossiper`]; the swarm drives it through
//! [`Transport`]. Payloads are opaque to the transport.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SwarmError;
use crate::name::PeerName;
use crate::state::SubscriptionState;

/// Gossip callbacks the transport invokes, possibly concurrently.
pub trait Gossiper: Send + Sync {
    /// Returns the full local state for periodic exchange.
    fn gossip(&self) -> SubscriptionState;

    /// Merges a periodic gossip payload. Returns what was new, if anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to decode.
    fn on_gossip(&self, buf: &[u8]) -> Result<Option<SubscriptionState>, SwarmError>;

    /// Merges a broadcast payload. Returns what was new, if anything, for
    /// further propagation.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to decode.
    fn on_gossip_broadcast(
        &self,
        src: PeerName,
        buf: &[u8],
    ) -> Result<Option<SubscriptionState>, SwarmError>;

    /// Handles a unicast payload carrying a message frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame fails to decode.
    fn on_gossip_unicast(&self, src: PeerName, buf: &[u8]) -> Result<(), SwarmError>;
}

/// A node as currently seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescription {
    /// Node name.
    pub name: PeerName,
    /// Human-readable nickname.
    pub nickname: String,
    /// Address the node can be dialed on, when known.
    pub address: Option<String>,
    /// True for the local node.
    pub is_self: bool,
    /// Number of established connections the node reports.
    pub num_connections: usize,
}

impl PeerDescription {
    /// Creates a description of a remote node.
    #[must_use]
    pub fn remote(name: PeerName, num_connections: usize) -> Self {
        Self {
            name,
            nickname: name.to_string(),
            address: None,
            is_self: false,
            num_connections,
        }
    }

    /// Creates a description of the local node.
    #[must_use]
    pub fn local(name: PeerName, num_connections: usize) -> Self {
        Self {
            is_self: true,
            ..Self::remote(name, num_connections)
        }
    }

    /// Sets the dial address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Returns the address to rejoin the node on: its dial address when
    /// known, otherwise its nickname.
    #[must_use]
    pub fn join_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.nickname)
    }
}

/// Operations the swarm needs from the transport.
pub trait Transport: Send + Sync {
    /// Registers the gossiper the transport calls back into.
    fn attach(&self, gossiper: Weak<dyn Gossiper>);

    /// Starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot start.
    fn start(&self) -> Result<(), SwarmError>;

    /// Stops serving. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails.
    fn stop(&self) -> Result<(), SwarmError>;

    /// Describes every node the transport knows, including itself.
    fn descriptions(&self) -> Vec<PeerDescription>;

    /// Initiates a connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be initiated.
    fn connect(&self, addr: &str) -> Result<(), SwarmError>;

    /// Queues a payload for reliable broadcast to every node.
    fn broadcast(&self, payload: Bytes);

    /// Sends a payload to a single node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unreachable.
    fn unicast(&self, to: PeerName, payload: Bytes) -> Result<(), SwarmError>;
}

/// Resolved settings handed to the transport at construction.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Local node name.
    pub name: PeerName,
    /// Address to bind.
    pub listen: SocketAddr,
    /// Address advertised to other nodes.
    pub advertise: SocketAddr,
    /// Shared secret for transport authentication.
    pub passphrase: Option<String>,
    /// Maximum number of connections.
    pub conn_limit: usize,
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("name", &self.name)
            .field("listen", &self.listen)
            .field("advertise", &self.advertise)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("conn_limit", &self.conn_limit)
            .finish()
    }
}

/// Builds the transport once the swarm has resolved its settings.
pub trait TransportFactory {
    /// Creates the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be created.
    fn build(&self, config: TransportConfig) -> Result<Arc<dyn Transport>, SwarmError>;
}

impl<F> TransportFactory for F
where
    F: Fn(TransportConfig) -> Result<Arc<dyn Transport>, SwarmError>,
{
    fn build(&self, config: TransportConfig) -> Result<Arc<dyn Transport>, SwarmError> {
        self(config)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    config: Option<TransportConfig>,
    gossiper: Option<Weak<dyn Gossiper>>,
    descriptions: Vec<PeerDescription>,
    refused: HashSet<String>,
    connects: Vec<String>,
    broadcasts: Vec<Bytes>,
    unicasts: Vec<(PeerName, Bytes)>,
    unreachable: HashSet<PeerName>,
    started: bool,
    stop_calls: usize,
    fail_start: bool,
    fail_stop: bool,
}

/// In-memory transport that records every call.
///
/// Nothing is delivered on its own: tests read the recorded payloads and feed
/// them to other swarms through [`Gossiper`].
#[derive(Debug, Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    /// Creates a fake transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a factory handing out this transport.
    #[must_use]
    pub fn factory(self: &Arc<Self>) -> impl TransportFactory + use<> {
        let transport = Arc::clone(self);
        move |config: TransportConfig| -> Result<Arc<dyn Transport>, SwarmError> {
            transport.state.lock().config = Some(config);
            Ok(Arc::clone(&transport) as Arc<dyn Transport>)
        }
    }

    /// Returns the config the transport was built with.
    #[must_use]
    pub fn config(&self) -> Option<TransportConfig> {
        self.state.lock().config.clone()
    }

    /// Returns the attached gossiper, if it is still alive.
    #[must_use]
    pub fn gossiper(&self) -> Option<Arc<dyn Gossiper>> {
        self.state.lock().gossiper.as_ref().and_then(Weak::upgrade)
    }

    /// Replaces the descriptions reported to the swarm.
    pub fn set_descriptions(&self, descriptions: Vec<PeerDescription>) {
        self.state.lock().descriptions = descriptions;
    }

    /// Makes connections to `addr` fail.
    pub fn refuse(&self, addr: impl Into<String>) {
        self.state.lock().refused.insert(addr.into());
    }

    /// Makes unicasts to `name` fail.
    pub fn set_unreachable(&self, name: PeerName) {
        self.state.lock().unreachable.insert(name);
    }

    /// Makes `start` fail until [`FakeTransport::allow_start`] is called.
    pub fn fail_start(&self) {
        self.state.lock().fail_start = true;
    }

    /// Lets `start` succeed again.
    pub fn allow_start(&self) {
        self.state.lock().fail_start = false;
    }

    /// Makes every `stop` call fail.
    pub fn fail_stop(&self) {
        self.state.lock().fail_stop = true;
    }

    /// Returns every address a connection was initiated to.
    #[must_use]
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    /// Drains the recorded broadcasts.
    #[must_use]
    pub fn take_broadcasts(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().broadcasts)
    }

    /// Drains the recorded unicasts.
    #[must_use]
    pub fn take_unicasts(&self) -> Vec<(PeerName, Bytes)> {
        std::mem::take(&mut self.state.lock().unicasts)
    }

    /// Returns true once started and not yet stopped.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Returns how many times `stop` was called.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }
}

impl Transport for FakeTransport {
    fn attach(&self, gossiper: Weak<dyn Gossiper>) {
        self.state.lock().gossiper = Some(gossiper);
    }

    fn start(&self) -> Result<(), SwarmError> {
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(SwarmError::Transport("bind failed".to_string()));
        }
        state.started = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), SwarmError> {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        state.started = false;
        if state.fail_stop {
            return Err(SwarmError::Transport("stop failed".to_string()));
        }
        Ok(())
    }

    fn descriptions(&self) -> Vec<PeerDescription> {
        self.state.lock().descriptions.clone()
    }

    fn connect(&self, addr: &str) -> Result<(), SwarmError> {
        let mut state = self.state.lock();
        if state.refused.contains(addr) {
            return Err(SwarmError::Transport(format!("connection to {addr} refused")));
        }
        state.connects.push(addr.to_string());
        Ok(())
    }

    fn broadcast(&self, payload: Bytes) {
        self.state.lock().broadcasts.push(payload);
    }

    fn unicast(&self, to: PeerName, payload: Bytes) -> Result<(), SwarmError> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&to) {
            return Err(SwarmError::Transport(format!("peer {to} unreachable")));
        }
        state.unicasts.push((to, payload));
        Ok(())
    }
}

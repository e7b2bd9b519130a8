//! # mesh-swarm
//!
//! Cluster-wide subscription gossip for a distributed pub/sub broker.
//!
//! This crate provides:
//!
//! - A replicated, conflict-free subscription set keyed by subscription event
//! - Per-node peer tracking with liveness sweeps and eviction
//! - Mesh reinforcement for poorly connected nodes
//! - Batched message forwarding between nodes
//!
//! ## Core Types
//!
//! - [`Swarm`]: Orchestrates state, peers and the transport for one node
//! - [`SubscriptionState`]: Last-writer-wins set of subscription events
//! - [`SubscriptionEvent`]: A (node, connection, ssid) triple and its key
//! - [`Peer`] / [`PeerRegistry`]: Local view of remote nodes
//! - [`Transport`] / [`Gossiper`]: Contract with the gossip transport
//! - [`Frame`]: Batch of messages forwarded to one node

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod name;
pub mod peer;
pub mod state;
pub mod swarm;
pub mod transport;

pub use config::SwarmConfig;
pub use error::{DecodeError, SwarmError};
pub use event::{ConnectionId, EventKey, Ssid, SubscriptionEvent};
pub use frame::{Frame, Message};
pub use name::PeerName;
pub use peer::{Peer, PeerRegistry};
pub use state::{Marker, MarkerKind, SubscriptionState};
pub use swarm::{ClusterHandler, Swarm};
pub use transport::{
    FakeTransport, Gossiper, PeerDescription, Transport, TransportConfig, TransportFactory,
};

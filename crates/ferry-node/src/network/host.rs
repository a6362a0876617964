//! Network-Layer Capability Contract
//!
//! The pipeline never touches the swarm directly; every component receives a
//! [`Host`] by reference. The production implementation lives in
//! [`crate::network::swarm`]; tests substitute hand-written fakes.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::broadcast;

use super::types::PeerRecord;

/// Whether the network layer currently holds a connection to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    NotConnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("no direct connection: {0}")]
    HolePunch(String),
    #[error("network layer unavailable: {0}")]
    Unavailable(String),
}

/// Capabilities the session consumes from the networking substrate.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Stable identity of the local endpoint.
    fn peer_id(&self) -> PeerId;

    /// Current local multiaddresses (listen plus confirmed external).
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Notifications whenever the local address set changes. Receivers get
    /// the full updated set.
    fn subscribe_addrs(&self) -> broadcast::Receiver<Vec<Multiaddr>>;

    /// Establishes a connection to the peer, using the record's addresses as
    /// hints. Resolves once a connection exists or the dial failed.
    async fn connect(&self, record: &PeerRecord) -> Result<(), HostError>;

    async fn connectedness(&self, peer_id: PeerId) -> Connectedness;

    /// Permits NAT traversal coordination for this peer. Must be called
    /// before [`Host::connect`] so the hole-punch coordinator observes the
    /// allowance.
    async fn allow_hole_punch(&self, peer_id: PeerId);

    /// Resolves once a direct (non-relayed) connection to the peer exists,
    /// or fails when the hole punch does.
    async fn wait_for_direct_conn(&self, peer_id: PeerId) -> Result<(), HostError>;

    /// Closes any relay-mediated connections to the peer so subsequent
    /// streams open on the direct path.
    async fn close_relayed_connections(&self, peer_id: PeerId);
}

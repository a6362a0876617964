//! Discovery Workers
//!
//! Two channels (multicast DNS for the local link, the public DHT for the
//! open Internet) × two time offsets (current and previous slot) give four
//! workers per session. Senders advertise, receivers look up; both rotate
//! their rendezvous identifier at every slot boundary.

pub mod dht;
pub mod mdns;
pub mod stage;
pub mod zeroconf;

use thiserror::Error;

use super::host::HostError;

pub use dht::{default_bootstrap_peers, DhtAdvertiser, DhtClient, DhtDiscoverer};
pub use mdns::{MdnsAdvertiser, MdnsDiscoverer, MdnsFactory, MdnsHandle};
pub use stage::{Stage, StatusHandle, WorkerStatus};
pub use zeroconf::ZeroconfMdns;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no bootstrap peers configured")]
    NoBootstrapPeers,

    #[error("bootstrap connection threshold not reached ({connected}/{required} connected)")]
    ConnThresholdNotReached {
        connected: usize,
        required: usize,
        /// Every per-peer bootstrap failure, collected before the threshold
        /// check so the error carries the full picture.
        errors: Vec<HostError>,
    },

    #[error("discovery cancelled")]
    Cancelled,

    #[error("multicast dns: {0}")]
    Mdns(String),

    #[error("dht: {0}")]
    Dht(String),
}

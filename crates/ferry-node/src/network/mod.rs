//! P2P Session Module
//!
//! Rendezvous and authentication pipeline built on libp2p. A session owns
//! four discovery workers (two channels × two time offsets), a peer-state
//! table, and the connection & authentication driver that promotes exactly
//! one discovered peer to an authenticated session.
//!
//! This module contains:
//! - `config`: Session configuration from environment
//! - `host`: Capability contract the pipeline consumes from the network layer
//! - `behaviour`: libp2p NetworkBehaviour configuration
//! - `swarm`: Swarm builder, event loop, and the libp2p-backed substrate
//! - `discovery`: mDNS and DHT advertise/lookup workers
//! - `driver`: Per-candidate connect + PAKE state machine
//! - `pake`: SPAKE2 key exchange over the request-response protocol
//! - `supervisor`: Top-level session state machine
//! - `types`: Shared types (PeerRecord, peer-state table, session state)

pub mod behaviour;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod host;
pub mod pake;
pub mod supervisor;
pub mod swarm;
pub mod types;

pub use behaviour::FerryBehaviour;
pub use config::NetworkConfig;
pub use discovery::{DiscoveryError, Stage};
pub use host::{Connectedness, Host, HostError};
pub use pake::{KeyExchange, PakeError, SharedSecret};
pub use supervisor::{SessionOutcome, SessionSupervisor};
pub use types::{PeerRecord, PeerState, PeerStateTable, SessionState, SessionStateCell};

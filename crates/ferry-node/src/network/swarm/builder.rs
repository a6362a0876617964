//! Swarm Builder
//!
//! Handles libp2p swarm creation with TCP/QUIC transports, noise encryption,
//! yamux multiplexing, and a relay client for NAT traversal.

use anyhow::Result;
use libp2p::{identity, noise, swarm::Swarm, tcp, yamux, PeerId};
use tracing::debug;

use super::super::behaviour::FerryBehaviour;
use super::super::config::NetworkConfig;

/// Creates and configures a libp2p swarm from an existing identity.
pub fn build_swarm(
    config: &NetworkConfig,
    keypair: identity::Keypair,
) -> Result<(Swarm<FerryBehaviour>, PeerId)> {
    let idle_timeout = config.connection_idle_timeout;

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_dns()?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = key.public().to_peer_id();
            debug!(peer_id = %local_peer_id, "Created swarm identity");
            FerryBehaviour::new(local_peer_id, key.public(), relay_client)
        })?
        .with_swarm_config(move |c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    let local_peer_id = *swarm.local_peer_id();

    swarm.listen_on(format!("/ip4/0.0.0.0/tcp/{}", config.listen_port).parse()?)?;
    swarm.listen_on(format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?)?;
    debug!(port = config.listen_port, "Configured P2P listen addresses");

    Ok((swarm, local_peer_id))
}

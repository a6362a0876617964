//! libp2p NetworkBehaviour for a ferry session
//!
//! Combines:
//! - **Identify**: peer information exchange (feeds the address book)
//! - **Kademlia**: provider records in the public DHT
//! - **Relay client + DCUtR**: relayed connections upgraded by hole punching
//! - **Request-response**: the PAKE exchange

use libp2p::kad::store::MemoryStore;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{dcutr, identify, kad, relay, PeerId, StreamProtocol};

use super::pake::{PakeRequest, PakeResponse};

#[derive(NetworkBehaviour)]
pub struct FerryBehaviour {
    /// Identify protocol for peer information exchange
    pub identify: identify::Behaviour,
    /// Kademlia DHT for global rendezvous via provider records
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Relay client for reaching peers behind NATs
    pub relay_client: relay::client::Behaviour,
    /// Direct connection upgrade (hole punching) over relayed connections
    pub dcutr: dcutr::Behaviour,
    /// Password-authenticated key exchange
    pub pake: request_response::json::Behaviour<PakeRequest, PakeResponse>,
}

impl FerryBehaviour {
    pub fn new(
        local_peer_id: PeerId,
        local_public_key: libp2p::identity::PublicKey,
        relay_client: relay::client::Behaviour,
    ) -> Self {
        let identify = identify::Behaviour::new(identify::Config::new(
            "/ferry/id/1".to_string(),
            local_public_key,
        ));

        // Server mode so our provider announcements are served back to the
        // network.
        let mut kademlia =
            kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let dcutr = dcutr::Behaviour::new(local_peer_id);

        let pake = request_response::json::Behaviour::new(
            [(StreamProtocol::new("/ferry/pake/1"), ProtocolSupport::Full)],
            request_response::Config::default(),
        );

        Self {
            identify,
            kademlia,
            relay_client,
            dcutr,
            pake,
        }
    }
}

//! libp2p Substrate
//!
//! `build_swarm` creates the swarm, `EventLoop` owns it, and [`NetworkHost`]
//! is the clonable handle the pipeline talks to: it implements the host,
//! DHT, and key-exchange-transport contracts by sending commands into the
//! event loop.

pub mod builder;
pub mod event_loop;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ferry_core::ContentId;
use libp2p::kad::RecordKey;
use libp2p::{identity, Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::config::NetworkConfig;
use super::discovery::{default_bootstrap_peers, DhtClient, DiscoveryError};
use super::host::{Connectedness, Host, HostError};
use super::pake::{PakeError, PakeRequest, PakeResponder, PakeResponse, PakeTransport, ResponderOutcome};
use super::types::PeerRecord;

pub use builder::build_swarm;
pub use event_loop::{EventLoop, SwarmCommand};

/// Handle onto the running swarm event loop.
#[derive(Clone)]
pub struct NetworkHost {
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    local_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    addr_events: broadcast::Sender<Vec<Multiaddr>>,
}

impl NetworkHost {
    async fn command(&self, cmd: SwarmCommand) -> Result<(), HostError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| HostError::Unavailable("event loop stopped".to_string()))
    }
}

#[async_trait]
impl Host for NetworkHost {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        self.local_addrs
            .read()
            .expect("local addrs poisoned")
            .clone()
    }

    fn subscribe_addrs(&self) -> broadcast::Receiver<Vec<Multiaddr>> {
        self.addr_events.subscribe()
    }

    async fn connect(&self, record: &PeerRecord) -> Result<(), HostError> {
        let (reply, rx) = oneshot::channel();
        self.command(SwarmCommand::Dial {
            record: record.clone(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| HostError::Unavailable("event loop stopped".to_string()))?
            .map_err(HostError::Dial)
    }

    async fn connectedness(&self, peer_id: PeerId) -> Connectedness {
        let (reply, rx) = oneshot::channel();
        if self
            .command(SwarmCommand::Connectedness { peer_id, reply })
            .await
            .is_err()
        {
            return Connectedness::NotConnected;
        }
        match rx.await {
            Ok(true) => Connectedness::Connected,
            _ => Connectedness::NotConnected,
        }
    }

    async fn allow_hole_punch(&self, peer_id: PeerId) {
        let _ = self.command(SwarmCommand::AllowHolePunch { peer_id }).await;
    }

    async fn wait_for_direct_conn(&self, peer_id: PeerId) -> Result<(), HostError> {
        let (reply, rx) = oneshot::channel();
        self.command(SwarmCommand::WaitDirectConn { peer_id, reply })
            .await?;
        rx.await
            .map_err(|_| HostError::Unavailable("event loop stopped".to_string()))?
            .map_err(HostError::HolePunch)
    }

    async fn close_relayed_connections(&self, peer_id: PeerId) {
        let _ = self.command(SwarmCommand::CloseRelayed { peer_id }).await;
    }
}

#[async_trait]
impl DhtClient for NetworkHost {
    fn bootstrap_peers(&self) -> Vec<PeerRecord> {
        default_bootstrap_peers()
    }

    async fn provide(&self, content_id: &ContentId) -> Result<(), DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.command(SwarmCommand::StartProviding {
            key: RecordKey::new(&content_id.to_bytes()),
            reply,
        })
        .await
        .map_err(|e| DiscoveryError::Dht(e.to_string()))?;
        rx.await
            .map_err(|_| DiscoveryError::Dht("event loop stopped".to_string()))?
            .map_err(DiscoveryError::Dht)
    }

    async fn stop_providing(&self, content_id: &ContentId) {
        let _ = self
            .command(SwarmCommand::StopProviding {
                key: RecordKey::new(&content_id.to_bytes()),
            })
            .await;
    }

    async fn find_providers(&self, content_id: &ContentId) -> mpsc::Receiver<PeerRecord> {
        let (found, rx) = mpsc::channel(16);
        let _ = self
            .command(SwarmCommand::FindProviders {
                key: RecordKey::new(&content_id.to_bytes()),
                found,
            })
            .await;
        rx
    }
}

#[async_trait]
impl PakeTransport for NetworkHost {
    async fn request(
        &self,
        peer_id: PeerId,
        request: PakeRequest,
    ) -> Result<PakeResponse, PakeError> {
        let (reply, rx) = oneshot::channel();
        self.command(SwarmCommand::SendPakeRequest {
            peer_id,
            request,
            reply,
        })
        .await
        .map_err(|e| PakeError::Transport(e.to_string()))?;
        rx.await
            .map_err(|_| PakeError::Transport("event loop stopped".to_string()))?
            .map_err(PakeError::Transport)
    }
}

/// Builds the swarm, spawns the event loop, and returns the substrate handle
/// plus the stream of inbound authentication verdicts.
pub fn start_network(
    config: &NetworkConfig,
    keypair: identity::Keypair,
    channel: u32,
    password: &str,
) -> anyhow::Result<(Arc<NetworkHost>, mpsc::UnboundedReceiver<ResponderOutcome>)> {
    let (swarm, peer_id) = build_swarm(config, keypair)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (auth_tx, auth_rx) = mpsc::unbounded_channel();
    let (addr_events, _) = broadcast::channel(16);
    let local_addrs = Arc::new(RwLock::new(Vec::new()));

    let responder = PakeResponder::new(channel, password);
    let event_loop = EventLoop::new(
        swarm,
        cmd_rx,
        auth_tx,
        responder,
        local_addrs.clone(),
        addr_events.clone(),
    );
    tokio::spawn(event_loop.run());

    Ok((
        Arc::new(NetworkHost {
            peer_id,
            cmd_tx,
            local_addrs,
            addr_events,
        }),
        auth_rx,
    ))
}

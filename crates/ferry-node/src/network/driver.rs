//! Connection & Authentication Driver
//!
//! Every candidate a discoverer emits lands here, possibly concurrently from
//! all four workers. The peer-state table serializes attempts against the
//! same remote; the session-state compare-and-swap picks the single winner
//! that becomes the authenticated peer.

use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::host::{Connectedness, Host};
use super::pake::{KeyExchange, SharedSecret};
use super::types::{
    PeerRecord, PeerState, PeerStateTable, SessionState, SessionStateCell, TransitionDecision,
};

/// The peer that won the session, plus the key the exchange produced.
#[derive(Debug, Clone)]
pub struct AuthenticatedPeer {
    pub peer_id: PeerId,
    pub shared_secret: SharedSecret,
}

/// Terminal driver reports to the supervisor.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Authentication succeeded and a direct connection exists; the transfer
    /// layer may take over.
    Ready(AuthenticatedPeer),
    /// The winning candidate was lost after authentication; the session
    /// cannot recover.
    Failed(String),
}

pub struct ConnectionDriver {
    host: Arc<dyn Host>,
    key_exchange: Arc<dyn KeyExchange>,
    peer_states: Arc<PeerStateTable>,
    session_state: Arc<SessionStateCell>,
    /// Cancels the four discovery workers once a peer won.
    discovery_stop: CancellationToken,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
}

impl ConnectionDriver {
    pub fn new(
        host: Arc<dyn Host>,
        key_exchange: Arc<dyn KeyExchange>,
        peer_states: Arc<PeerStateTable>,
        session_state: Arc<SessionStateCell>,
        discovery_stop: CancellationToken,
        events_tx: mpsc::UnboundedSender<DriverEvent>,
    ) -> Self {
        Self {
            host,
            key_exchange,
            peer_states,
            session_state,
            discovery_stop,
            events_tx,
        }
    }

    /// Handles one discovered candidate. Callable concurrently; long-running
    /// work is fine here, the discoverers dispatch fire-and-forget.
    pub async fn on_peer_found(&self, record: PeerRecord) {
        if self.session_state.get() != SessionState::Roaming {
            debug!(
                peer_id = %record.peer_id,
                "Received a candidate although we're not roaming, dropping"
            );
            return;
        }

        // Allow-list before dialling so the NAT traversal coordinator
        // observes the allowance for this peer.
        self.host.allow_hole_punch(record.peer_id).await;

        match self.peer_states.try_begin_connecting(record.peer_id) {
            TransitionDecision::Proceed { retry: false } => {}
            TransitionDecision::Proceed { retry: true } => {
                debug!(
                    peer_id = %record.peer_id,
                    "Previous connection attempt failed, trying again"
                );
            }
            TransitionDecision::AlreadyConnecting => {
                debug!(
                    peer_id = %record.peer_id,
                    "Already trying to connect, skipping"
                );
                return;
            }
            TransitionDecision::Blacklisted => {
                debug!(
                    peer_id = %record.peer_id,
                    "Peer failed authentication earlier, skipping"
                );
                return;
            }
            TransitionDecision::AlreadyConnected => return,
        }

        debug!(peer_id = %record.peer_id, "Connecting to peer");
        if let Err(e) = self.host.connect(&record).await {
            debug!(peer_id = %record.peer_id, error = %e, "Connecting failed");
            self.peer_states
                .store(record.peer_id, PeerState::FailedConnecting);
            return;
        }

        let shared_secret = match self.key_exchange.start_key_exchange(record.peer_id).await {
            Ok(secret) => secret,
            Err(e) => {
                warn!(peer_id = %record.peer_id, error = %e, "Peer didn't pass authentication");
                self.peer_states
                    .store(record.peer_id, PeerState::FailedAuthentication);
                return;
            }
        };
        self.peer_states.store(record.peer_id, PeerState::Connected);

        if !self.session_state.try_connect() {
            debug!(
                peer_id = %record.peer_id,
                "Already authenticated with another peer"
            );
            return;
        }

        // The winner could have dropped between authentication and here.
        if self.host.connectedness(record.peer_id).await == Connectedness::NotConnected {
            let _ = self.events_tx.send(DriverEvent::Failed(
                "lost connection to the authenticated peer".to_string(),
            ));
            return;
        }

        info!(
            peer_id_short = &record.peer_id.to_base58()[46..],
            "Peer authenticated, stopping discovery"
        );
        self.discovery_stop.cancel();

        if let Err(e) = self.host.wait_for_direct_conn(record.peer_id).await {
            let _ = self
                .events_tx
                .send(DriverEvent::Failed(format!("hole punching failed: {e}")));
            return;
        }

        // The transfer stream must not ride a relay.
        self.host.close_relayed_connections(record.peer_id).await;

        let _ = self.events_tx.send(DriverEvent::Ready(AuthenticatedPeer {
            peer_id: record.peer_id,
            shared_secret,
        }));
    }
}

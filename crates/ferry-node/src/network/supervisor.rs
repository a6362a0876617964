//! Session Supervisor
//!
//! Owns the four discovery workers (two channels × two time offsets), the
//! peer-state table, and the session lifecycle. The supervisor watches every
//! worker's done signal uniformly: if all workers error out the session
//! fails, if all reach a terminal stage the discovery phase is over and the
//! authentication outcome decides the session result.

use std::sync::Arc;

use ferry_core::Deriver;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::NetworkConfig;
use super::discovery::{
    DhtAdvertiser, DhtClient, DhtDiscoverer, MdnsAdvertiser, MdnsDiscoverer, MdnsFactory, Stage,
    StatusHandle, WorkerStatus,
};
use super::driver::{ConnectionDriver, DriverEvent};
use super::host::{Connectedness, Host};
use super::pake::{KeyExchange, ResponderOutcome, SharedSecret};
use super::types::{PeerStateTable, SessionState, SessionStateCell};

/// Which side of the rendezvous this process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Advertise our presence; authentication arrives inbound.
    Send,
    /// Look up the advertiser and initiate authentication.
    Receive,
}

/// Final session verdict surfaced to the caller.
#[derive(Debug)]
pub enum SessionOutcome {
    Ready {
        peer_id: PeerId,
        shared_secret: SharedSecret,
    },
    Cancelled,
    Stopped,
    Failed(String),
}

impl SessionOutcome {
    pub fn describe(&self) -> String {
        match self {
            SessionOutcome::Ready { .. } => "ready".to_string(),
            SessionOutcome::Cancelled => "cancelled".to_string(),
            SessionOutcome::Stopped => "stopped".to_string(),
            SessionOutcome::Failed(e) => format!("failed: {e}"),
        }
    }
}

pub struct SessionSupervisor {
    role: SessionRole,
    channel: u32,
    config: NetworkConfig,
    host: Arc<dyn Host>,
    dht: Arc<dyn DhtClient>,
    mdns: Arc<dyn MdnsFactory>,

    /// Receive role only: initiates the key exchange per candidate.
    key_exchange: Option<Arc<dyn KeyExchange>>,
    /// Send role only: verdicts from the inbound exchange responder.
    auth_rx: Option<mpsc::UnboundedReceiver<ResponderOutcome>>,

    peer_states: Arc<PeerStateTable>,
    session_state: Arc<SessionStateCell>,
    session_token: CancellationToken,
    discovery_stop: CancellationToken,

    workers: Vec<(StatusHandle, JoinHandle<()>)>,
    done_tx: mpsc::Sender<()>,
    done_rx: Option<mpsc::Receiver<()>>,
    driver_events_rx: Option<mpsc::UnboundedReceiver<DriverEvent>>,
}

impl SessionSupervisor {
    /// Supervisor for the advertising (sending) side.
    pub fn sender(
        channel: u32,
        config: NetworkConfig,
        host: Arc<dyn Host>,
        dht: Arc<dyn DhtClient>,
        mdns: Arc<dyn MdnsFactory>,
        auth_rx: mpsc::UnboundedReceiver<ResponderOutcome>,
    ) -> Result<Self, String> {
        config.validate()?;
        Ok(Self::new(
            SessionRole::Send,
            channel,
            config,
            host,
            dht,
            mdns,
            None,
            Some(auth_rx),
        ))
    }

    /// Supervisor for the discovering (receiving) side.
    pub fn receiver(
        channel: u32,
        config: NetworkConfig,
        host: Arc<dyn Host>,
        dht: Arc<dyn DhtClient>,
        mdns: Arc<dyn MdnsFactory>,
        key_exchange: Arc<dyn KeyExchange>,
    ) -> Result<Self, String> {
        config.validate()?;
        Ok(Self::new(
            SessionRole::Receive,
            channel,
            config,
            host,
            dht,
            mdns,
            Some(key_exchange),
            None,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        role: SessionRole,
        channel: u32,
        config: NetworkConfig,
        host: Arc<dyn Host>,
        dht: Arc<dyn DhtClient>,
        mdns: Arc<dyn MdnsFactory>,
        key_exchange: Option<Arc<dyn KeyExchange>>,
        auth_rx: Option<mpsc::UnboundedReceiver<ResponderOutcome>>,
    ) -> Self {
        let session_token = CancellationToken::new();
        let discovery_stop = session_token.child_token();
        let (done_tx, done_rx) = mpsc::channel(8);
        Self {
            role,
            channel,
            config,
            host,
            dht,
            mdns,
            key_exchange,
            auth_rx,
            peer_states: Arc::new(PeerStateTable::new()),
            session_state: Arc::new(SessionStateCell::new()),
            session_token,
            discovery_stop,
            workers: Vec::new(),
            done_tx,
            done_rx: Some(done_rx),
            driver_events_rx: None,
        }
    }

    /// Token that cancels the whole session; hand this to the signal
    /// handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.session_token.clone()
    }

    /// Requests session shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.session_token.cancel();
    }

    pub fn peer_states(&self) -> Arc<PeerStateTable> {
        self.peer_states.clone()
    }

    /// Snapshot of every worker's status, for the final report.
    pub fn worker_statuses(&self) -> Vec<(&'static str, WorkerStatus)> {
        self.workers
            .iter()
            .map(|(status, _)| (status.name(), status.get()))
            .collect()
    }

    /// Live handles onto the worker statuses; valid beyond [`Self::run`].
    pub fn status_handles(&self) -> Vec<StatusHandle> {
        self.workers.iter().map(|(s, _)| s.clone()).collect()
    }

    /// Spawns the four discovery workers for this role. Idempotent.
    pub fn start_discovery(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        self.session_state.set_roaming();

        let slot_secs = self.config.slot_length.as_secs() as i64;
        let derivers = [
            Deriver::new(self.config.slot_length),
            Deriver::new(self.config.slot_length).with_offset(-slot_secs),
        ];

        match self.role {
            SessionRole::Send => {
                for (deriver, mdns_name, dht_name) in [
                    (derivers[0], "mdns", "dht"),
                    (derivers[1], "mdns-prev", "dht-prev"),
                ] {
                    if self.config.enable_mdns {
                        let worker = MdnsAdvertiser::new(
                            mdns_name,
                            deriver,
                            self.channel,
                            self.mdns.clone(),
                        );
                        self.spawn(worker.status(), worker.run(
                            self.discovery_stop.child_token(),
                            self.session_token.clone(),
                        ));
                    }
                    if self.config.enable_dht {
                        let worker = DhtAdvertiser::new(
                            dht_name,
                            deriver,
                            self.channel,
                            self.host.clone(),
                            self.dht.clone(),
                            self.config.conn_threshold,
                        );
                        self.spawn(worker.status(), worker.run(
                            self.discovery_stop.child_token(),
                            self.session_token.clone(),
                        ));
                    }
                }
            }
            SessionRole::Receive => {
                let key_exchange = self
                    .key_exchange
                    .clone()
                    .expect("receive role constructed with a key exchange");
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.driver_events_rx = Some(events_rx);

                let driver = Arc::new(ConnectionDriver::new(
                    self.host.clone(),
                    key_exchange,
                    self.peer_states.clone(),
                    self.session_state.clone(),
                    self.discovery_stop.clone(),
                    events_tx,
                ));

                // Candidates are dispatched fire-and-forget so a slow
                // connection attempt never blocks a discoverer.
                let (found_tx, mut found_rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    while let Some(record) = found_rx.recv().await {
                        let driver = driver.clone();
                        tokio::spawn(async move { driver.on_peer_found(record).await });
                    }
                });

                for (deriver, mdns_name, dht_name) in [
                    (derivers[0], "mdns", "dht"),
                    (derivers[1], "mdns-prev", "dht-prev"),
                ] {
                    if self.config.enable_mdns {
                        let worker = MdnsDiscoverer::new(
                            mdns_name,
                            deriver,
                            self.channel,
                            self.host.peer_id(),
                            self.mdns.clone(),
                            found_tx.clone(),
                        );
                        self.spawn(worker.status(), worker.run(
                            self.discovery_stop.child_token(),
                            self.session_token.clone(),
                        ));
                    }
                    if self.config.enable_dht {
                        let worker = DhtDiscoverer::new(
                            dht_name,
                            deriver,
                            self.channel,
                            self.host.clone(),
                            self.dht.clone(),
                            self.config.conn_threshold,
                            self.config.lookup_timeout,
                            found_tx.clone(),
                        );
                        self.spawn(worker.status(), worker.run(
                            self.discovery_stop.child_token(),
                            self.session_token.clone(),
                        ));
                    }
                }
            }
        }

        info!(
            role = ?self.role,
            channel = self.channel,
            workers = self.workers.len(),
            "Discovery started"
        );
    }

    fn spawn(
        &mut self,
        status: StatusHandle,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let done_tx = self.done_tx.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            let _ = done_tx.send(()).await;
        });
        self.workers.push((status, handle));
    }

    /// Runs the session to completion.
    pub async fn run(mut self) -> SessionOutcome {
        self.start_discovery();

        let mut done_rx = self
            .done_rx
            .take()
            .expect("done receiver consumed twice");
        let mut driver_events_rx = self.driver_events_rx.take();
        let mut auth_rx = self.auth_rx.take();
        let session_token = self.session_token.clone();

        loop {
            tokio::select! {
                _ = session_token.cancelled() => {
                    info!("Session shutdown requested");
                    self.join_workers().await;
                    return SessionOutcome::Cancelled;
                }

                // Receive role: the driver reports the verdict.
                Some(event) = recv_driver(&mut driver_events_rx) => match event {
                    DriverEvent::Ready(auth) => {
                        self.join_workers().await;
                        return SessionOutcome::Ready {
                            peer_id: auth.peer_id,
                            shared_secret: auth.shared_secret,
                        };
                    }
                    DriverEvent::Failed(message) => {
                        warn!(error = %message, "Session failed after authentication");
                        self.session_token.cancel();
                        self.join_workers().await;
                        return SessionOutcome::Failed(message);
                    }
                },

                // Send role: the inbound exchange responder reports verdicts.
                Some(outcome) = recv_auth(&mut auth_rx) => match outcome {
                    ResponderOutcome::Failed { peer_id } => {
                        debug!(
                            peer_id = %peer_id,
                            "Peer failed authentication, continuing to advertise"
                        );
                    }
                    ResponderOutcome::Authenticated { peer_id, shared_secret } => {
                        match self.finish_inbound_auth(peer_id, shared_secret).await {
                            Some(outcome) => return outcome,
                            None => continue,
                        }
                    }
                },

                Some(()) = done_rx.recv() => {
                    if let Some(outcome) = self.evaluate_workers().await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// One worker finished; re-evaluate the failure policy.
    async fn evaluate_workers(&mut self) -> Option<SessionOutcome> {
        let statuses: Vec<WorkerStatus> =
            self.workers.iter().map(|(s, _)| s.get()).collect();

        if statuses.iter().all(|s| s.stage == Stage::Error) {
            let detail = statuses
                .iter()
                .filter_map(|s| s.error.clone())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(error = %detail, "All discovery workers failed");
            self.session_token.cancel();
            self.join_workers().await;
            return Some(SessionOutcome::Failed(format!(
                "all discovery workers failed: {detail}"
            )));
        }

        if statuses.iter().all(|s| s.stage.is_terminal()) {
            debug!("All discovery workers terminal");
            // A mix of stopped and errored workers normally means a peer was
            // found and the authentication outcome is still in flight; keep
            // watching. Anything else is a finished, empty discovery.
            if self.session_state.get() == SessionState::Roaming
                && !self.session_token.is_cancelled()
                && !self.discovery_stop.is_cancelled()
            {
                self.join_workers().await;
                return Some(SessionOutcome::Stopped);
            }
        }

        None
    }

    /// Send role: a peer passed the inbound key exchange. Returns the final
    /// outcome, or `None` when this peer lost the race and the session keeps
    /// going.
    async fn finish_inbound_auth(
        &mut self,
        peer_id: PeerId,
        shared_secret: SharedSecret,
    ) -> Option<SessionOutcome> {
        if !self.session_state.try_connect() {
            debug!(peer_id = %peer_id, "Already authenticated with another peer");
            return None;
        }

        if self.host.connectedness(peer_id).await == Connectedness::NotConnected {
            self.session_token.cancel();
            self.join_workers().await;
            return Some(SessionOutcome::Failed(
                "lost connection to the authenticated peer".to_string(),
            ));
        }

        info!(
            peer_id_short = &peer_id.to_base58()[46..],
            "Peer authenticated, stopping discovery"
        );
        self.discovery_stop.cancel();

        if let Err(e) = self.host.wait_for_direct_conn(peer_id).await {
            self.session_token.cancel();
            self.join_workers().await;
            return Some(SessionOutcome::Failed(format!("hole punching failed: {e}")));
        }

        self.host.close_relayed_connections(peer_id).await;
        self.join_workers().await;
        Some(SessionOutcome::Ready {
            peer_id,
            shared_secret,
        })
    }

    async fn join_workers(&mut self) {
        for (status, handle) in self.workers.drain(..) {
            let _ = handle.await;
            info!(
                worker = status.name(),
                status = status.get().describe(),
                "Discovery worker finished"
            );
        }
    }
}

async fn recv_driver(
    rx: &mut Option<mpsc::UnboundedReceiver<DriverEvent>>,
) -> Option<DriverEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_auth(
    rx: &mut Option<mpsc::UnboundedReceiver<ResponderOutcome>>,
) -> Option<ResponderOutcome> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

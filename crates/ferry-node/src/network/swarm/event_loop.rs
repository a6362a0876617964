//! Swarm Event Loop
//!
//! Owns the libp2p swarm; all network I/O flows through this task. Other
//! tasks reach it through [`SwarmCommand`]s with oneshot replies; Kademlia
//! queries are correlated back to their callers through pending-query maps.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use libp2p::kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, Swarm, SwarmEvent};
use libp2p::{dcutr, identify, Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::super::behaviour::{FerryBehaviour, FerryBehaviourEvent};
use super::super::discovery::default_bootstrap_peers;
use super::super::pake::{PakeRequest, PakeResponder, PakeResponse, ResponderOutcome};
use super::super::types::PeerRecord;

/// Commands accepted by the event loop.
pub enum SwarmCommand {
    Dial {
        record: PeerRecord,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Connectedness {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    AllowHolePunch {
        peer_id: PeerId,
    },
    WaitDirectConn {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<(), String>>,
    },
    CloseRelayed {
        peer_id: PeerId,
    },
    StartProviding {
        key: RecordKey,
        reply: oneshot::Sender<Result<(), String>>,
    },
    StopProviding {
        key: RecordKey,
    },
    FindProviders {
        key: RecordKey,
        found: mpsc::Sender<PeerRecord>,
    },
    SendPakeRequest {
        peer_id: PeerId,
        request: PakeRequest,
        reply: oneshot::Sender<Result<PakeResponse, String>>,
    },
}

pub struct EventLoop {
    swarm: Swarm<FerryBehaviour>,
    cmd_rx: mpsc::Receiver<SwarmCommand>,

    /// Inbound key-exchange verdicts, surfaced to the session supervisor.
    auth_tx: mpsc::UnboundedSender<ResponderOutcome>,
    responder: PakeResponder,

    /// Shared with [`super::NetworkHost`]; listen plus confirmed external
    /// addresses.
    local_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    addr_events: broadcast::Sender<Vec<Multiaddr>>,

    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    pending_provides: HashMap<QueryId, oneshot::Sender<Result<(), String>>>,
    provider_queries: HashMap<QueryId, mpsc::Sender<PeerRecord>>,
    pending_pake: HashMap<OutboundRequestId, oneshot::Sender<Result<PakeResponse, String>>>,
    direct_waiters: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,

    /// Remote address of every live connection, for the relayed/direct
    /// distinction.
    connections: HashMap<PeerId, HashMap<ConnectionId, Multiaddr>>,
    /// Addresses learned from identify and Kademlia, attached to provider
    /// results.
    address_book: HashMap<PeerId, HashSet<Multiaddr>>,
    hole_punch_allowed: HashSet<PeerId>,
}

fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

impl EventLoop {
    pub fn new(
        swarm: Swarm<FerryBehaviour>,
        cmd_rx: mpsc::Receiver<SwarmCommand>,
        auth_tx: mpsc::UnboundedSender<ResponderOutcome>,
        responder: PakeResponder,
        local_addrs: Arc<RwLock<Vec<Multiaddr>>>,
        addr_events: broadcast::Sender<Vec<Multiaddr>>,
    ) -> Self {
        Self {
            swarm,
            cmd_rx,
            auth_tx,
            responder,
            local_addrs,
            addr_events,
            pending_dials: HashMap::new(),
            pending_provides: HashMap::new(),
            provider_queries: HashMap::new(),
            pending_pake: HashMap::new(),
            direct_waiters: HashMap::new(),
            connections: HashMap::new(),
            address_book: HashMap::new(),
            hole_punch_allowed: HashSet::new(),
        }
    }

    /// Runs until every command sender is dropped.
    pub async fn run(mut self) {
        // Seed the routing table so provider queries have somewhere to go.
        for record in default_bootstrap_peers() {
            for addr in &record.addrs {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&record.peer_id, addr.clone());
            }
        }

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("All command senders dropped, stopping event loop");
                        break;
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::Dial { record, reply } => {
                if self.connections.contains_key(&record.peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                for addr in &record.addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&record.peer_id, addr.clone());
                }
                let opts = DialOpts::peer_id(record.peer_id)
                    .addresses(record.addrs.clone())
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials
                            .entry(record.peer_id)
                            .or_default()
                            .push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            SwarmCommand::Connectedness { peer_id, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer_id));
            }
            SwarmCommand::AllowHolePunch { peer_id } => {
                self.hole_punch_allowed.insert(peer_id);
            }
            SwarmCommand::WaitDirectConn { peer_id, reply } => {
                if self.has_direct_conn(&peer_id) {
                    let _ = reply.send(Ok(()));
                } else {
                    self.direct_waiters.entry(peer_id).or_default().push(reply);
                }
            }
            SwarmCommand::CloseRelayed { peer_id } => {
                if let Some(conns) = self.connections.get(&peer_id) {
                    let relayed: Vec<ConnectionId> = conns
                        .iter()
                        .filter(|(_, addr)| is_relayed(addr))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in relayed {
                        debug!(peer_id = %peer_id, "Closing relayed connection");
                        self.swarm.close_connection(id);
                    }
                }
            }
            SwarmCommand::StartProviding { key, reply } => {
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(query_id) => {
                        self.pending_provides.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            SwarmCommand::StopProviding { key } => {
                self.swarm.behaviour_mut().kademlia.stop_providing(&key);
            }
            SwarmCommand::FindProviders { key, found } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.provider_queries.insert(query_id, found);
            }
            SwarmCommand::SendPakeRequest {
                peer_id,
                request,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .pake
                    .send_request(&peer_id, request);
                self.pending_pake.insert(request_id, reply);
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<FerryBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(address = %address, "P2P network listening");
                self.add_local_addr(address);
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!(address = %address, "External address confirmed");
                self.add_local_addr(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.remove_local_addr(&address);
            }
            SwarmEvent::ExternalAddrExpired { address } => {
                self.remove_local_addr(&address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let remote_addr = endpoint.get_remote_address().clone();
                info!(
                    peer_id_short = &peer_id.to_base58()[46..],
                    remote_addr = %remote_addr,
                    relayed = is_relayed(&remote_addr),
                    "Peer connected"
                );
                let direct = !is_relayed(&remote_addr);
                self.connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, remote_addr);

                if let Some(replies) = self.pending_dials.remove(&peer_id) {
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                }
                if direct {
                    if let Some(waiters) = self.direct_waiters.remove(&peer_id) {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                debug!(
                    peer_id_short = &peer_id.to_base58()[46..],
                    cause = ?cause,
                    "Peer disconnected"
                );
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    trace!(
                        peer_id_short = &peer_id.to_base58()[46..],
                        error = %error,
                        "Outgoing connection failed"
                    );
                    if !self.connections.contains_key(&peer_id) {
                        if let Some(replies) = self.pending_dials.remove(&peer_id) {
                            for reply in replies {
                                let _ = reply.send(Err(error.to_string()));
                            }
                        }
                    }
                } else {
                    trace!(error = %error, "Outgoing connection failed to unknown peer");
                }
            }
            SwarmEvent::Behaviour(FerryBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) => {
                trace!(
                    peer_id_short = &peer_id.to_base58()[46..],
                    listen_addrs = info.listen_addrs.len(),
                    "Identify: received peer info"
                );
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.address_book.entry(peer_id).or_default().insert(addr);
                }
            }
            SwarmEvent::Behaviour(FerryBehaviourEvent::Identify(_)) => {}
            SwarmEvent::Behaviour(FerryBehaviourEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event);
            }
            SwarmEvent::Behaviour(FerryBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            })) => {
                if !self.hole_punch_allowed.contains(&remote_peer_id) {
                    trace!(
                        peer_id_short = &remote_peer_id.to_base58()[46..],
                        "Ignoring hole punch event for non-allow-listed peer"
                    );
                    return;
                }
                match result {
                    Ok(_) => {
                        info!(
                            peer_id_short = &remote_peer_id.to_base58()[46..],
                            "Hole punch succeeded"
                        );
                        if let Some(waiters) = self.direct_waiters.remove(&remote_peer_id) {
                            for waiter in waiters {
                                let _ = waiter.send(Ok(()));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            peer_id_short = &remote_peer_id.to_base58()[46..],
                            error = %e,
                            "Hole punch failed"
                        );
                        if let Some(waiters) = self.direct_waiters.remove(&remote_peer_id) {
                            for waiter in waiters {
                                let _ = waiter.send(Err(e.to_string()));
                            }
                        }
                    }
                }
            }
            SwarmEvent::Behaviour(FerryBehaviourEvent::RelayClient(event)) => {
                trace!(event = ?event, "Relay client event");
            }
            SwarmEvent::Behaviour(FerryBehaviourEvent::Pake(event)) => {
                self.handle_pake_event(event);
            }
            SwarmEvent::IncomingConnection { .. } => {
                trace!("Incoming connection attempt");
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                trace!(error = %error, "Incoming connection failed");
            }
            _ => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                QueryResult::StartProviding(result) => {
                    if let Some(reply) = self.pending_provides.remove(&id) {
                        let _ = reply.send(result.map(|_| ()).map_err(|e| e.to_string()));
                    }
                }
                QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    let local_peer_id = *self.swarm.local_peer_id();
                    for provider in providers {
                        if provider == local_peer_id {
                            continue;
                        }
                        let addrs: Vec<Multiaddr> = self
                            .address_book
                            .get(&provider)
                            .map(|set| set.iter().cloned().collect())
                            .unwrap_or_default();
                        debug!(
                            peer_id_short = &provider.to_base58()[46..],
                            addrs = addrs.len(),
                            "DHT: found provider"
                        );
                        if let Some(found) = self.provider_queries.get(&id) {
                            // Never stall the swarm on a slow consumer.
                            let _ = found.try_send(PeerRecord::new(provider, addrs));
                        }
                    }
                    if step.last {
                        self.provider_queries.remove(&id);
                    }
                }
                QueryResult::GetProviders(Ok(
                    GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    self.provider_queries.remove(&id);
                }
                QueryResult::GetProviders(Err(e)) => {
                    debug!(error = %e, "DHT: provider lookup failed");
                    self.provider_queries.remove(&id);
                }
                other => {
                    trace!(result = ?other, "Kademlia: query progressed");
                }
            },
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                let book = self.address_book.entry(peer).or_default();
                for addr in addresses.iter() {
                    book.insert(addr.clone());
                }
            }
            other => {
                trace!(event = ?other, "Kademlia: DHT event");
            }
        }
    }

    fn handle_pake_event(
        &mut self,
        event: request_response::Event<PakeRequest, PakeResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let (response, outcome) = self.responder.on_request(peer, request);
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .pake
                        .send_response(channel, response);
                    if let Some(outcome) = outcome {
                        let _ = self.auth_tx.send(outcome);
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_pake.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some(reply) = self.pending_pake.remove(&request_id) {
                    let _ = reply.send(Err(error.to_string()));
                }
            }
            request_response::Event::InboundFailure { error, .. } => {
                debug!(error = %error, "Inbound key-exchange request failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn has_direct_conn(&self, peer_id: &PeerId) -> bool {
        self.connections
            .get(peer_id)
            .map(|conns| conns.values().any(|addr| !is_relayed(addr)))
            .unwrap_or(false)
    }

    fn add_local_addr(&mut self, addr: Multiaddr) {
        let snapshot = {
            let mut addrs = self.local_addrs.write().expect("local addrs poisoned");
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
            addrs.clone()
        };
        let _ = self.addr_events.send(snapshot);
    }

    fn remove_local_addr(&mut self, addr: &Multiaddr) {
        let snapshot = {
            let mut addrs = self.local_addrs.write().expect("local addrs poisoned");
            addrs.retain(|a| a != addr);
            addrs.clone()
        };
        let _ = self.addr_events.send(snapshot);
    }
}

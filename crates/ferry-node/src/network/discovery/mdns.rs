//! Multicast DNS Workers
//!
//! The mDNS channel is strictly link-local: advertisers publish the current
//! rendezvous identifier as a service on the local link, discoverers resolve
//! it and keep only candidates with private addresses. On every slot
//! boundary the service is torn down and re-created under the new name.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use ferry_core::Deriver;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::super::types::{only_private, PeerRecord};
use super::stage::{Stage, StatusHandle};
use super::DiscoveryError;

/// A running multicast service; dropping the box without calling `close`
/// leaks the registration until the daemon shuts down.
pub trait MdnsHandle: Send {
    fn close(self: Box<Self>);
}

/// Creates multicast services bound to a rendezvous service name.
pub trait MdnsFactory: Send + Sync + 'static {
    /// Announces the local peer under `service_name`.
    fn advertise(&self, service_name: &str) -> Result<Box<dyn MdnsHandle>, DiscoveryError>;

    /// Resolves peers announcing `service_name`; every resolved peer is sent
    /// on `found`.
    fn browse(
        &self,
        service_name: &str,
        found: mpsc::UnboundedSender<PeerRecord>,
    ) -> Result<Box<dyn MdnsHandle>, DiscoveryError>;
}

/// Sleep until a wall-clock instant; resolves immediately if it passed.
pub(crate) async fn sleep_until_wall(deadline: SystemTime) {
    let remaining = deadline
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    tokio::time::sleep(remaining).await;
}

/// Keeps the local peer announced under the current rendezvous name.
pub struct MdnsAdvertiser {
    deriver: Deriver,
    channel: u32,
    factory: Arc<dyn MdnsFactory>,
    status: StatusHandle,
}

impl MdnsAdvertiser {
    pub fn new(
        name: &'static str,
        deriver: Deriver,
        channel: u32,
        factory: Arc<dyn MdnsFactory>,
    ) -> Self {
        Self {
            deriver,
            channel,
            factory,
            status: StatusHandle::new(name),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub async fn run(self, stop: CancellationToken, session: CancellationToken) {
        loop {
            let name = self.deriver.discovery_id(self.channel, SystemTime::now());
            self.status.set_stage(Stage::Provide);

            let service = match self.factory.advertise(&name) {
                Ok(service) => service,
                Err(e) => {
                    self.status.set_error(e);
                    return;
                }
            };
            info!(
                worker = self.status.name(),
                service_name = %name,
                "Started mDNS service"
            );

            let deadline = self.deriver.next_rotation(SystemTime::now());
            tokio::select! {
                _ = stop.cancelled() => {
                    service.close();
                    self.status.set_stopped(session.is_cancelled());
                    return;
                }
                _ = sleep_until_wall(deadline) => {
                    debug!(worker = self.status.name(), "Slot rotation, re-announcing");
                    service.close();
                }
            }
        }
    }
}

/// Resolves peers announcing the current rendezvous name on the local link.
pub struct MdnsDiscoverer {
    deriver: Deriver,
    channel: u32,
    local_peer_id: PeerId,
    factory: Arc<dyn MdnsFactory>,
    found_tx: mpsc::UnboundedSender<PeerRecord>,
    status: StatusHandle,
}

impl MdnsDiscoverer {
    pub fn new(
        name: &'static str,
        deriver: Deriver,
        channel: u32,
        local_peer_id: PeerId,
        factory: Arc<dyn MdnsFactory>,
        found_tx: mpsc::UnboundedSender<PeerRecord>,
    ) -> Self {
        Self {
            deriver,
            channel,
            local_peer_id,
            factory,
            found_tx,
            status: StatusHandle::new(name),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub async fn run(self, stop: CancellationToken, session: CancellationToken) {
        loop {
            let name = self.deriver.discovery_id(self.channel, SystemTime::now());
            self.status.set_stage(Stage::Lookup);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let service = match self.factory.browse(&name, tx) {
                Ok(service) => service,
                Err(e) => {
                    self.status.set_error(e);
                    return;
                }
            };
            debug!(
                worker = self.status.name(),
                service_name = %name,
                "Started mDNS resolver"
            );

            // One emission per peer per discovery cycle.
            let mut seen = HashSet::new();
            let mut open = true;
            let deadline = self.deriver.next_rotation(SystemTime::now());
            let rotate = loop {
                tokio::select! {
                    _ = stop.cancelled() => break false,
                    _ = sleep_until_wall(deadline) => break true,
                    found = rx.recv(), if open => match found {
                        Some(record) => self.handle_found(record, &mut seen),
                        // The resolver has nothing more to deliver this
                        // cycle; wait out the slot.
                        None => open = false,
                    }
                }
            };

            service.close();
            if !rotate {
                self.status.set_stopped(session.is_cancelled());
                return;
            }
            self.status.set_stage(Stage::Retrying);
        }
    }

    fn handle_found(&self, record: PeerRecord, seen: &mut HashSet<PeerId>) {
        if record.peer_id == self.local_peer_id {
            trace!("Found ourselves");
            return;
        }
        if !seen.insert(record.peer_id) {
            return;
        }

        // mDNS is link-local; a candidate advertising only public addresses
        // cannot be a neighbour.
        let addrs = only_private(record.addrs);
        if addrs.is_empty() {
            debug!(
                peer_id = %record.peer_id,
                "Peer has no private addresses, dropping"
            );
            return;
        }

        info!(
            peer_id_short = &record.peer_id.to_base58()[46..],
            "Found peer via mDNS"
        );
        let _ = self.found_tx.send(PeerRecord::new(record.peer_id, addrs));
    }
}

//! Multicast DNS Substrate
//!
//! Service-daemon implementation of the [`MdnsFactory`] contract. The
//! rendezvous identifier rotates every slot, so services are registered
//! under a fixed DNS-SD type with the identifier as the instance name and a
//! TXT record; browsing filters resolved instances against the expected
//! identifier.

use std::str::FromStr;
use std::sync::Arc;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::super::host::Host;
use super::super::types::PeerRecord;
use super::mdns::{MdnsFactory, MdnsHandle};
use super::DiscoveryError;

const SERVICE_TYPE: &str = "_ferry._udp.local.";

/// TXT keys carried by every announcement.
const PROP_NAME: &str = "name";
const PROP_PEER: &str = "peer";
const PROP_ADDRS: &str = "addrs";

pub struct ZeroconfMdns {
    daemon: ServiceDaemon,
    host: Arc<dyn Host>,
}

impl ZeroconfMdns {
    pub fn new(host: Arc<dyn Host>) -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        Ok(Self { daemon, host })
    }
}

impl MdnsFactory for ZeroconfMdns {
    fn advertise(&self, service_name: &str) -> Result<Box<dyn MdnsHandle>, DiscoveryError> {
        let peer_id = self.host.peer_id();
        let addrs = self.host.addrs();
        let port = addrs
            .iter()
            .find_map(|addr| {
                addr.iter().find_map(|p| match p {
                    Protocol::Tcp(port) => Some(port),
                    _ => None,
                })
            })
            .unwrap_or_default();
        let addr_list = addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let properties = [
            (PROP_NAME, service_name),
            (PROP_PEER, &peer_id.to_base58()),
            (PROP_ADDRS, &addr_list),
        ];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            service_name,
            &format!("{}.local.", peer_id.to_base58()),
            "",
            port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Mdns(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        debug!(service_name, "Registered mDNS service");

        Ok(Box::new(Registration {
            daemon: self.daemon.clone(),
            fullname,
        }))
    }

    fn browse(
        &self,
        service_name: &str,
        found: mpsc::UnboundedSender<PeerRecord>,
    ) -> Result<Box<dyn MdnsHandle>, DiscoveryError> {
        let events = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;

        let expected = service_name.to_string();
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if let ServiceEvent::ServiceResolved(info) = event {
                    match decode_resolved(&info, &expected) {
                        Some(record) => {
                            if found.send(record).is_err() {
                                return;
                            }
                        }
                        None => {
                            trace!(
                                fullname = info.get_fullname(),
                                "Resolved service does not match our rendezvous name"
                            );
                        }
                    }
                }
            }
        });

        Ok(Box::new(Browse {
            daemon: self.daemon.clone(),
            task,
        }))
    }
}

struct Registration {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsHandle for Registration {
    fn close(self: Box<Self>) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(error = %e, "Couldn't unregister mDNS service");
        }
    }
}

struct Browse {
    daemon: ServiceDaemon,
    task: JoinHandle<()>,
}

impl MdnsHandle for Browse {
    fn close(self: Box<Self>) {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            warn!(error = %e, "Couldn't stop mDNS browse");
        }
        self.task.abort();
    }
}

/// Turns a resolved instance into a peer record, provided it announces the
/// rendezvous name we are looking for.
fn decode_resolved(info: &ServiceInfo, expected_name: &str) -> Option<PeerRecord> {
    if info.get_property_val_str(PROP_NAME)? != expected_name {
        return None;
    }
    let peer_id = PeerId::from_str(info.get_property_val_str(PROP_PEER)?).ok()?;

    let mut addrs = parse_addr_list(info.get_property_val_str(PROP_ADDRS).unwrap_or(""));
    if addrs.is_empty() {
        // Fall back to the addresses mDNS itself resolved.
        let port = info.get_port();
        addrs = info
            .get_addresses()
            .iter()
            .map(|ip| Multiaddr::from(*ip).with(Protocol::Tcp(port)))
            .collect();
    }

    Some(PeerRecord::new(peer_id, addrs))
}

/// Parses the comma-separated multiaddr list from a TXT record, skipping
/// anything malformed.
fn parse_addr_list(list: &str) -> Vec<Multiaddr> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_list_roundtrip() {
        let parsed = parse_addr_list("/ip4/192.168.1.2/tcp/4001,/ip4/10.0.0.1/udp/4001/quic-v1");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let parsed = parse_addr_list("/ip4/192.168.1.2/tcp/4001,not-a-multiaddr,");
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn empty_list_parses_to_nothing() {
        assert!(parse_addr_list("").is_empty());
    }
}

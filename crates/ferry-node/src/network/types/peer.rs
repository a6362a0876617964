//! Peer Records and Per-Peer Connection State

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// A candidate peer surfaced by a discovery channel.
///
/// The address set is advisory; the network layer remains authoritative and
/// may reach the peer through addresses not listed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }
}

/// Connection progress of a single discovered peer.
///
/// Valid transitions: `NotConnected → Connecting`,
/// `Connecting → {Connected, FailedConnecting, FailedAuthentication}`, and
/// `FailedConnecting → Connecting` for retries. `FailedAuthentication` is
/// final for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotConnected,
    Connecting,
    Connected,
    FailedConnecting,
    FailedAuthentication,
}

/// Whether an address is only routable on the local link or site.
///
/// Multicast DNS candidates advertising public addresses are spoofed or
/// misconfigured, so the mDNS path keeps private addresses only.
pub fn is_private_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|proto| match proto {
        Protocol::Ip4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        Protocol::Ip6(ip) => {
            ip.is_loopback()
                // unique-local fc00::/7
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
        _ => false,
    })
}

/// Filters an address set down to private addresses.
pub fn only_private(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    addrs.into_iter().filter(is_private_addr).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().expect("valid multiaddr")
    }

    #[test]
    fn private_ranges_are_private() {
        assert!(is_private_addr(&addr("/ip4/192.168.1.5/tcp/4001")));
        assert!(is_private_addr(&addr("/ip4/10.0.0.2/tcp/4001")));
        assert!(is_private_addr(&addr("/ip4/172.16.8.1/udp/4001/quic-v1")));
        assert!(is_private_addr(&addr("/ip4/127.0.0.1/tcp/4001")));
        assert!(is_private_addr(&addr("/ip6/::1/tcp/4001")));
        assert!(is_private_addr(&addr("/ip6/fe80::1/tcp/4001")));
        assert!(is_private_addr(&addr("/ip6/fd00::1/tcp/4001")));
    }

    #[test]
    fn public_ranges_are_not() {
        assert!(!is_private_addr(&addr("/ip4/1.2.3.4/tcp/4001")));
        assert!(!is_private_addr(&addr("/ip4/104.131.131.82/udp/4001/quic-v1")));
        assert!(!is_private_addr(&addr("/ip6/2001:db8::1/tcp/4001")));
        assert!(!is_private_addr(&addr("/dns4/bootstrap.libp2p.io/tcp/443")));
    }

    #[test]
    fn only_private_drops_public_addrs() {
        let filtered = only_private(vec![
            addr("/ip4/192.168.1.5/tcp/4001"),
            addr("/ip4/1.2.3.4/tcp/4001"),
        ]);
        assert_eq!(filtered, vec![addr("/ip4/192.168.1.5/tcp/4001")]);
    }

    #[test]
    fn public_only_sets_filter_to_empty() {
        let filtered = only_private(vec![addr("/ip4/8.8.8.8/tcp/4001")]);
        assert!(filtered.is_empty());
    }
}

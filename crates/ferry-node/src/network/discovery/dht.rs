//! DHT Workers
//!
//! The DHT channel reaches peers across the open Internet. Both workers
//! first connect to the built-in bootstrap peers and wait until the host is
//! publicly reachable; the advertiser then announces the content ID derived
//! from the current rendezvous identifier as provided, while the discoverer
//! runs bounded provider lookups in a retry loop.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use ferry_core::{ContentId, Deriver};
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::super::host::Host;
use super::super::types::{is_private_addr, PeerRecord};
use super::mdns::sleep_until_wall;
use super::stage::{Stage, StatusHandle};
use super::DiscoveryError;

/// Provider-record operations the workers need from the DHT substrate.
#[async_trait]
pub trait DhtClient: Send + Sync + 'static {
    /// The built-in bootstrap peer list.
    fn bootstrap_peers(&self) -> Vec<PeerRecord>;

    /// Announces the key as provided by the local peer. Resolves once the
    /// announcement reached the network.
    async fn provide(&self, content_id: &ContentId) -> Result<(), DiscoveryError>;

    /// Withdraws a previous announcement.
    async fn stop_providing(&self, content_id: &ContentId);

    /// Starts a provider lookup; results arrive on the returned channel and
    /// the channel closes when the lookup completes.
    async fn find_providers(&self, content_id: &ContentId) -> mpsc::Receiver<PeerRecord>;
}

/// Public bootstrap peers of the IPFS Amino DHT.
const BOOTSTRAP_ADDRS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

pub fn default_bootstrap_peers() -> Vec<PeerRecord> {
    BOOTSTRAP_ADDRS
        .iter()
        .map(|s| {
            let addr: Multiaddr = s.parse().expect("valid built-in bootstrap multiaddr");
            let peer_id = addr
                .iter()
                .find_map(|proto| match proto {
                    Protocol::P2p(peer_id) => Some(peer_id),
                    _ => None,
                })
                .expect("built-in bootstrap multiaddr carries a peer ID");
            PeerRecord::new(peer_id, vec![addr])
        })
        .collect()
}

/// Connects to every bootstrap peer concurrently and joins all attempts.
///
/// Failures are collected over a channel bounded to the list length; the
/// attempt as a whole fails only when fewer than `conn_threshold` peers
/// accepted. Cancellation during bootstrap is reported as such, never as a
/// threshold failure.
pub(crate) async fn bootstrap(
    host: &Arc<dyn Host>,
    dht: &Arc<dyn DhtClient>,
    conn_threshold: usize,
    stop: &CancellationToken,
) -> Result<(), DiscoveryError> {
    let peers = dht.bootstrap_peers();
    if peers.is_empty() {
        return Err(DiscoveryError::NoBootstrapPeers);
    }

    let (tx, mut rx) = mpsc::channel(peers.len());
    for record in peers {
        let host = host.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(host.connect(&record).await).await;
        });
    }
    drop(tx);

    let mut connected = 0;
    let mut errors = Vec::new();
    while let Some(result) = rx.recv().await {
        match result {
            Ok(()) => connected += 1,
            Err(e) => errors.push(e),
        }
    }

    if connected < conn_threshold {
        if stop.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        return Err(DiscoveryError::ConnThresholdNotReached {
            connected,
            required: conn_threshold,
            errors,
        });
    }

    debug!(connected, "Bootstrap complete");
    Ok(())
}

/// Blocks until the host reports at least one public address.
pub(crate) async fn wait_public_addrs(
    host: &dyn Host,
    stop: &CancellationToken,
) -> Result<Vec<Multiaddr>, DiscoveryError> {
    let mut updates = host.subscribe_addrs();
    loop {
        let public: Vec<Multiaddr> = host
            .addrs()
            .into_iter()
            .filter(|a| !is_private_addr(a))
            .collect();
        if !public.is_empty() {
            debug!(count = public.len(), "Public addresses available");
            return Ok(public);
        }

        tokio::select! {
            _ = stop.cancelled() => return Err(DiscoveryError::Cancelled),
            update = updates.recv() => match update {
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(DiscoveryError::Dht(
                        "address event stream closed".to_string(),
                    ));
                }
            }
        }
    }
}

/// Announces the current content ID as provided, re-announcing on every slot
/// rotation.
pub struct DhtAdvertiser {
    deriver: Deriver,
    channel: u32,
    host: Arc<dyn Host>,
    dht: Arc<dyn DhtClient>,
    conn_threshold: usize,
    status: StatusHandle,
}

impl DhtAdvertiser {
    pub fn new(
        name: &'static str,
        deriver: Deriver,
        channel: u32,
        host: Arc<dyn Host>,
        dht: Arc<dyn DhtClient>,
        conn_threshold: usize,
    ) -> Self {
        Self {
            deriver,
            channel,
            host,
            dht,
            conn_threshold,
            status: StatusHandle::new(name),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub async fn run(self, stop: CancellationToken, session: CancellationToken) {
        self.status.set_stage(Stage::Bootstrapping);
        match bootstrap(&self.host, &self.dht, self.conn_threshold, &stop).await {
            Ok(()) => {}
            Err(DiscoveryError::Cancelled) => {
                self.status.set_stopped(session.is_cancelled());
                return;
            }
            Err(e) => {
                self.status.set_error(e);
                return;
            }
        }

        self.status.set_stage(Stage::WaitingForPublicAddrs);
        match wait_public_addrs(self.host.as_ref(), &stop).await {
            Ok(_) => {}
            Err(DiscoveryError::Cancelled) => {
                self.status.set_stopped(session.is_cancelled());
                return;
            }
            Err(e) => {
                self.status.set_error(e);
                return;
            }
        }

        loop {
            let name = self.deriver.discovery_id(self.channel, SystemTime::now());
            let content_id = ContentId::from_discovery_id(&name);
            self.status.set_stage(Stage::Provide);
            info!(
                worker = self.status.name(),
                service_name = %name,
                "Providing rendezvous key in DHT"
            );

            if let Err(e) = self.dht.provide(&content_id).await {
                if stop.is_cancelled() {
                    self.status.set_stopped(session.is_cancelled());
                } else {
                    self.status.set_error(e);
                }
                return;
            }

            let deadline = self.deriver.next_rotation(SystemTime::now());
            tokio::select! {
                _ = stop.cancelled() => {
                    self.dht.stop_providing(&content_id).await;
                    self.status.set_stopped(session.is_cancelled());
                    return;
                }
                _ = sleep_until_wall(deadline) => {
                    debug!(worker = self.status.name(), "Slot rotation, re-providing");
                    self.dht.stop_providing(&content_id).await;
                }
            }
        }
    }
}

/// Looks up providers of the current content ID in a bounded retry loop.
pub struct DhtDiscoverer {
    deriver: Deriver,
    channel: u32,
    host: Arc<dyn Host>,
    dht: Arc<dyn DhtClient>,
    conn_threshold: usize,
    lookup_timeout: std::time::Duration,
    found_tx: mpsc::UnboundedSender<PeerRecord>,
    status: StatusHandle,
}

impl DhtDiscoverer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &'static str,
        deriver: Deriver,
        channel: u32,
        host: Arc<dyn Host>,
        dht: Arc<dyn DhtClient>,
        conn_threshold: usize,
        lookup_timeout: std::time::Duration,
        found_tx: mpsc::UnboundedSender<PeerRecord>,
    ) -> Self {
        Self {
            deriver,
            channel,
            host,
            dht,
            conn_threshold,
            lookup_timeout,
            found_tx,
            status: StatusHandle::new(name),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub async fn run(self, stop: CancellationToken, session: CancellationToken) {
        self.status.set_stage(Stage::Bootstrapping);
        match bootstrap(&self.host, &self.dht, self.conn_threshold, &stop).await {
            Ok(()) => {}
            Err(DiscoveryError::Cancelled) => {
                self.status.set_stopped(session.is_cancelled());
                return;
            }
            Err(e) => {
                self.status.set_error(e);
                return;
            }
        }

        self.status.set_stage(Stage::WaitingForPublicAddrs);
        match wait_public_addrs(self.host.as_ref(), &stop).await {
            Ok(_) => {}
            Err(DiscoveryError::Cancelled) => {
                self.status.set_stopped(session.is_cancelled());
                return;
            }
            Err(e) => {
                self.status.set_error(e);
                return;
            }
        }

        loop {
            let name = self.deriver.discovery_id(self.channel, SystemTime::now());
            let content_id = ContentId::from_discovery_id(&name);
            self.status.set_stage(Stage::Lookup);
            debug!(
                worker = self.status.name(),
                service_name = %name,
                "Looking up rendezvous key in DHT"
            );

            // Bounded per attempt so the key is re-derived when the slot
            // rotates underneath a slow lookup.
            let mut providers = self.dht.find_providers(&content_id).await;
            let deadline = tokio::time::Instant::now() + self.lookup_timeout;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        self.status.set_stopped(session.is_cancelled());
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    found = providers.recv() => match found {
                        Some(record) if record.peer_id == self.host.peer_id() => {}
                        Some(record) if !record.addrs.is_empty() => {
                            info!(
                                peer_id_short = &record.peer_id.to_base58()[46..],
                                "Found peer via DHT"
                            );
                            let _ = self.found_tx.send(record);
                        }
                        Some(record) => {
                            debug!(
                                peer_id = %record.peer_id,
                                "Provider has no addresses, dropping"
                            );
                        }
                        None => break,
                    }
                }
            }

            if stop.is_cancelled() {
                self.status.set_stopped(session.is_cancelled());
                return;
            }
            self.status.set_stage(Stage::Retrying);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::host::{Connectedness, Host, HostError};
    use super::*;
    use libp2p::PeerId;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct FakeHost {
        peer_id: PeerId,
        addrs: Mutex<Vec<Multiaddr>>,
        addr_events: broadcast::Sender<Vec<Multiaddr>>,
        /// Peers whose dials fail; everything else succeeds.
        refuse: Vec<PeerId>,
        connects: Mutex<Vec<PeerId>>,
    }

    impl FakeHost {
        fn new(refuse: Vec<PeerId>) -> Self {
            let (addr_events, _) = broadcast::channel(8);
            Self {
                peer_id: PeerId::random(),
                addrs: Mutex::new(vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()]),
                addr_events,
                refuse,
                connects: Mutex::new(Vec::new()),
            }
        }

        fn set_addrs(&self, addrs: Vec<Multiaddr>) {
            *self.addrs.lock().unwrap() = addrs.clone();
            let _ = self.addr_events.send(addrs);
        }
    }

    #[async_trait]
    impl Host for FakeHost {
        fn peer_id(&self) -> PeerId {
            self.peer_id
        }
        fn addrs(&self) -> Vec<Multiaddr> {
            self.addrs.lock().unwrap().clone()
        }
        fn subscribe_addrs(&self) -> broadcast::Receiver<Vec<Multiaddr>> {
            self.addr_events.subscribe()
        }
        async fn connect(&self, record: &PeerRecord) -> Result<(), HostError> {
            self.connects.lock().unwrap().push(record.peer_id);
            if self.refuse.contains(&record.peer_id) {
                Err(HostError::Dial("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
        async fn connectedness(&self, _: PeerId) -> Connectedness {
            Connectedness::Connected
        }
        async fn allow_hole_punch(&self, _: PeerId) {}
        async fn wait_for_direct_conn(&self, _: PeerId) -> Result<(), HostError> {
            Ok(())
        }
        async fn close_relayed_connections(&self, _: PeerId) {}
    }

    struct FakeDht {
        bootstrap: Vec<PeerRecord>,
        providers: Mutex<HashMap<Vec<u8>, Vec<PeerRecord>>>,
    }

    impl FakeDht {
        fn new(bootstrap: Vec<PeerRecord>) -> Self {
            Self {
                bootstrap,
                providers: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl DhtClient for FakeDht {
        fn bootstrap_peers(&self) -> Vec<PeerRecord> {
            self.bootstrap.clone()
        }
        async fn provide(&self, _: &ContentId) -> Result<(), DiscoveryError> {
            Ok(())
        }
        async fn stop_providing(&self, _: &ContentId) {}
        async fn find_providers(&self, content_id: &ContentId) -> mpsc::Receiver<PeerRecord> {
            let (tx, rx) = mpsc::channel(16);
            let records = self
                .providers
                .lock()
                .unwrap()
                .get(&content_id.to_bytes())
                .cloned()
                .unwrap_or_default();
            tokio::spawn(async move {
                for record in records {
                    let _ = tx.send(record).await;
                }
            });
            rx
        }
    }

    fn bootstrap_list(n: usize) -> Vec<PeerRecord> {
        (0..n)
            .map(|_| {
                PeerRecord::new(
                    PeerId::random(),
                    vec!["/ip4/9.9.9.9/tcp/4001".parse().unwrap()],
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_bootstrap_list_fails_immediately() {
        let host: Arc<dyn Host> = Arc::new(FakeHost::new(vec![]));
        let dht: Arc<dyn DhtClient> = Arc::new(FakeDht::new(vec![]));
        let result = bootstrap(&host, &dht, 3, &CancellationToken::new()).await;
        assert!(matches!(result, Err(DiscoveryError::NoBootstrapPeers)));
    }

    #[tokio::test]
    async fn bootstrap_succeeds_exactly_at_threshold() {
        let peers = bootstrap_list(5);
        // Two refusals leave three successes, exactly the threshold.
        let refuse = vec![peers[0].peer_id, peers[1].peer_id];
        let host: Arc<dyn Host> = Arc::new(FakeHost::new(refuse));
        let dht: Arc<dyn DhtClient> = Arc::new(FakeDht::new(peers));
        let result = bootstrap(&host, &dht, 3, &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bootstrap_fails_one_below_threshold() {
        let peers = bootstrap_list(5);
        let refuse = vec![peers[0].peer_id, peers[1].peer_id, peers[2].peer_id];
        let host: Arc<dyn Host> = Arc::new(FakeHost::new(refuse));
        let dht: Arc<dyn DhtClient> = Arc::new(FakeDht::new(peers));
        match bootstrap(&host, &dht, 3, &CancellationToken::new()).await {
            Err(DiscoveryError::ConnThresholdNotReached {
                connected,
                required,
                errors,
            }) => {
                assert_eq!(connected, 2);
                assert_eq!(required, 3);
                assert_eq!(errors.len(), 3);
            }
            other => panic!("expected threshold error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_during_bootstrap_is_not_a_threshold_error() {
        let peers = bootstrap_list(3);
        let refuse: Vec<_> = peers.iter().map(|p| p.peer_id).collect();
        let host: Arc<dyn Host> = Arc::new(FakeHost::new(refuse));
        let dht: Arc<dyn DhtClient> = Arc::new(FakeDht::new(peers));
        let stop = CancellationToken::new();
        stop.cancel();
        let result = bootstrap(&host, &dht, 3, &stop).await;
        assert!(matches!(result, Err(DiscoveryError::Cancelled)));
    }

    #[tokio::test]
    async fn wait_public_addrs_blocks_until_update() {
        let host = Arc::new(FakeHost::new(vec![]));
        host.set_addrs(vec!["/ip4/192.168.1.2/tcp/4001".parse().unwrap()]);

        let waiter = {
            let host = host.clone();
            let stop = CancellationToken::new();
            tokio::spawn(async move { wait_public_addrs(host.as_ref(), &stop).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        host.set_addrs(vec![
            "/ip4/192.168.1.2/tcp/4001".parse().unwrap(),
            "/ip4/1.2.3.4/tcp/4001".parse().unwrap(),
        ]);
        let public = waiter.await.unwrap().expect("public address surfaced");
        assert_eq!(public, vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()]);
    }

    #[tokio::test]
    async fn wait_public_addrs_returns_cancellation() {
        let host = Arc::new(FakeHost::new(vec![]));
        host.set_addrs(vec!["/ip4/192.168.1.2/tcp/4001".parse().unwrap()]);
        let stop = CancellationToken::new();
        stop.cancel();
        let result = wait_public_addrs(host.as_ref(), &stop).await;
        assert!(matches!(result, Err(DiscoveryError::Cancelled)));
    }

    #[tokio::test]
    async fn discoverer_emits_providers_with_addresses_only() {
        let peers = bootstrap_list(3);
        let host: Arc<dyn Host> = Arc::new(FakeHost::new(vec![]));
        let dht = Arc::new(FakeDht::new(peers));

        let deriver = Deriver::new(Duration::from_secs(300));
        let name = deriver.discovery_id(7, SystemTime::now());
        let content_id = ContentId::from_discovery_id(&name);

        let with_addrs = PeerRecord::new(
            PeerId::random(),
            vec!["/ip4/1.1.1.1/tcp/4001".parse().unwrap()],
        );
        let without_addrs = PeerRecord::new(PeerId::random(), vec![]);
        dht.providers.lock().unwrap().insert(
            content_id.to_bytes(),
            vec![with_addrs.clone(), without_addrs],
        );

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let worker = DhtDiscoverer::new(
            "dht-test",
            deriver,
            7,
            host,
            dht,
            3,
            Duration::from_millis(200),
            found_tx,
        );
        let status = worker.status();

        let stop = CancellationToken::new();
        let session = CancellationToken::new();
        let handle = tokio::spawn(worker.run(stop.clone(), session));

        let found = tokio::time::timeout(Duration::from_secs(2), found_rx.recv())
            .await
            .expect("candidate before timeout")
            .expect("channel open");
        assert_eq!(found, with_addrs);
        assert!(found_rx.try_recv().is_err(), "address-less provider leaked");

        stop.cancel();
        handle.await.unwrap();
        assert_eq!(status.stage(), Stage::Stopped);
    }

    #[tokio::test]
    async fn discoverer_errors_out_below_threshold() {
        let peers = bootstrap_list(3);
        let refuse: Vec<_> = peers.iter().map(|p| p.peer_id).collect();
        let host: Arc<dyn Host> = Arc::new(FakeHost::new(refuse));
        let dht: Arc<dyn DhtClient> = Arc::new(FakeDht::new(peers));

        let (found_tx, _found_rx) = mpsc::unbounded_channel();
        let worker = DhtDiscoverer::new(
            "dht-test",
            Deriver::new(Duration::from_secs(300)),
            7,
            host,
            dht,
            3,
            Duration::from_millis(100),
            found_tx,
        );
        let status = worker.status();

        worker
            .run(CancellationToken::new(), CancellationToken::new())
            .await;
        assert_eq!(status.stage(), Stage::Error);
        assert!(status.get().error.is_some());
    }

    #[test]
    fn built_in_bootstrap_list_parses() {
        let peers = default_bootstrap_peers();
        assert_eq!(peers.len(), 5);
        for record in peers {
            assert!(!record.addrs.is_empty());
        }
    }
}

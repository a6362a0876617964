//! In-process session tests against fake substrates.
//!
//! The pipeline talks to the network layer exclusively through the host,
//! DHT, mDNS, and key-exchange contracts, so a whole session can run inside
//! one tokio runtime with hand-written fakes standing in for libp2p.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::ContentId;
use ferry_node::network::discovery::{
    DhtClient, DiscoveryError, MdnsFactory, MdnsHandle, Stage,
};
use ferry_node::network::pake::{KeyExchange, PakeError, ResponderOutcome, SharedSecret};
use ferry_node::network::{
    Connectedness, Host, HostError, NetworkConfig, PeerRecord, PeerState, SessionOutcome,
    SessionSupervisor,
};
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Fakes
// ============================================================================

struct FakeHost {
    peer_id: PeerId,
    addr_events: broadcast::Sender<Vec<Multiaddr>>,
    refuse: Mutex<HashSet<PeerId>>,
    connect_calls: AtomicUsize,
}

impl FakeHost {
    fn new() -> Self {
        let (addr_events, _) = broadcast::channel(8);
        Self {
            peer_id: PeerId::random(),
            addr_events,
            refuse: Mutex::new(HashSet::new()),
            connect_calls: AtomicUsize::new(0),
        }
    }

    fn refuse(&self, peer_id: PeerId) {
        self.refuse.lock().unwrap().insert(peer_id);
    }
}

#[async_trait]
impl Host for FakeHost {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }
    fn addrs(&self) -> Vec<Multiaddr> {
        vec![
            "/ip4/192.168.1.3/tcp/4001".parse().unwrap(),
            "/ip4/1.2.3.4/tcp/4001".parse().unwrap(),
        ]
    }
    fn subscribe_addrs(&self) -> broadcast::Receiver<Vec<Multiaddr>> {
        self.addr_events.subscribe()
    }
    async fn connect(&self, record: &PeerRecord) -> Result<(), HostError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse.lock().unwrap().contains(&record.peer_id) {
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
    /// Provider records returned once the failing rounds are exhausted.
    providers: Vec<PeerRecord>,
    /// Number of lookups that come back empty before providers appear.
    empty_rounds: AtomicUsize,
    provide_calls: AtomicUsize,
}

impl FakeDht {
    fn new(bootstrap_size: usize) -> Self {
        let bootstrap = (0..bootstrap_size)
            .map(|_| {
                PeerRecord::new(
                    PeerId::random(),
                    vec!["/ip4/9.9.9.9/tcp/4001".parse().unwrap()],
                )
            })
            .collect();
        Self {
            bootstrap,
            providers: Vec::new(),
            empty_rounds: AtomicUsize::new(0),
            provide_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DhtClient for FakeDht {
    fn bootstrap_peers(&self) -> Vec<PeerRecord> {
        self.bootstrap.clone()
    }
    async fn provide(&self, _: &ContentId) -> Result<(), DiscoveryError> {
        self.provide_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn stop_providing(&self, _: &ContentId) {}
    async fn find_providers(&self, _: &ContentId) -> mpsc::Receiver<PeerRecord> {
        let (tx, rx) = mpsc::channel(16);
        let records = if self
            .empty_rounds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Vec::new()
        } else {
            self.providers.clone()
        };
        tokio::spawn(async move {
            for record in records {
                let _ = tx.send(record).await;
            }
        });
        rx
    }
}

#[derive(Clone, Copy, PartialEq)]
enum MdnsMode {
    /// Browse emits the configured records, advertise is a no-op.
    Emit,
    /// Services start but never resolve anything.
    Quiet,
    /// Service creation fails outright.
    Fail,
}

struct FakeMdns {
    mode: MdnsMode,
    records: Vec<PeerRecord>,
}

struct NoopHandle;

impl MdnsHandle for NoopHandle {
    fn close(self: Box<Self>) {}
}

impl MdnsFactory for FakeMdns {
    fn advertise(&self, _: &str) -> Result<Box<dyn MdnsHandle>, DiscoveryError> {
        match self.mode {
            MdnsMode::Fail => Err(DiscoveryError::Mdns("no multicast socket".to_string())),
            _ => Ok(Box::new(NoopHandle)),
        }
    }
    fn browse(
        &self,
        _: &str,
        found: mpsc::UnboundedSender<PeerRecord>,
    ) -> Result<Box<dyn MdnsHandle>, DiscoveryError> {
        match self.mode {
            MdnsMode::Fail => Err(DiscoveryError::Mdns("no multicast socket".to_string())),
            MdnsMode::Quiet => Ok(Box::new(NoopHandle)),
            MdnsMode::Emit => {
                let records = self.records.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    for record in records {
                        let _ = found.send(record);
                    }
                });
                Ok(Box::new(NoopHandle))
            }
        }
    }
}

struct FakeKeyExchange {
    deny: HashSet<PeerId>,
}

impl FakeKeyExchange {
    fn accepting() -> Self {
        Self {
            deny: HashSet::new(),
        }
    }
}

#[async_trait]
impl KeyExchange for FakeKeyExchange {
    async fn start_key_exchange(&self, peer_id: PeerId) -> Result<SharedSecret, PakeError> {
        if self.deny.contains(&peer_id) {
            Err(PakeError::Auth("wrong passphrase".to_string()))
        } else {
            Ok([9u8; 32])
        }
    }
}

fn test_config() -> NetworkConfig {
    NetworkConfig {
        lookup_timeout: Duration::from_millis(100),
        ..NetworkConfig::default()
    }
}

fn private_record(peer_id: PeerId) -> PeerRecord {
    PeerRecord::new(peer_id, vec!["/ip4/192.168.1.7/tcp/4001".parse().unwrap()])
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn local_link_rendezvous_succeeds() {
    let sender = PeerId::random();

    let host = Arc::new(FakeHost::new());
    let dht = Arc::new(FakeDht::new(5));
    let mdns = Arc::new(FakeMdns {
        mode: MdnsMode::Emit,
        records: vec![private_record(sender)],
    });

    let mut supervisor = SessionSupervisor::receiver(
        1,
        test_config(),
        host.clone(),
        dht,
        mdns,
        Arc::new(FakeKeyExchange::accepting()),
    )
    .unwrap();
    supervisor.start_discovery();
    let statuses = supervisor.status_handles();
    let peer_states = supervisor.peer_states();
    assert_eq!(statuses.len(), 4);

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .expect("session finished");
    match outcome {
        SessionOutcome::Ready { peer_id, .. } => assert_eq!(peer_id, sender),
        other => panic!("expected ready, got {other:?}"),
    }

    assert_eq!(peer_states.get(&sender), Some(PeerState::Connected));
    for status in statuses {
        assert_eq!(status.stage(), Stage::Stopped, "{}", status.name());
    }
}

#[tokio::test]
async fn dht_rendezvous_tolerates_failing_bootstrap_peers() {
    let sender = PeerId::random();

    let host = Arc::new(FakeHost::new());
    let mut dht = FakeDht::new(5);
    // Two of five bootstrap peers are unreachable; threshold is three.
    host.refuse(dht.bootstrap[0].peer_id);
    host.refuse(dht.bootstrap[1].peer_id);
    // The sender shows up in the provider records after two empty lookups.
    dht.providers = vec![PeerRecord::new(
        sender,
        vec!["/ip4/5.6.7.8/tcp/4001".parse().unwrap()],
    )];
    dht.empty_rounds = AtomicUsize::new(2);

    let mdns = Arc::new(FakeMdns {
        mode: MdnsMode::Quiet,
        records: vec![],
    });

    let mut supervisor = SessionSupervisor::receiver(
        1,
        test_config(),
        host.clone(),
        Arc::new(dht),
        mdns,
        Arc::new(FakeKeyExchange::accepting()),
    )
    .unwrap();
    supervisor.start_discovery();
    let statuses = supervisor.status_handles();

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .expect("session finished");
    match outcome {
        SessionOutcome::Ready { peer_id, .. } => assert_eq!(peer_id, sender),
        other => panic!("expected ready, got {other:?}"),
    }

    // The quiet mDNS workers were stopped by the supervisor, not errored.
    for status in statuses {
        assert_eq!(status.stage(), Stage::Stopped, "{}", status.name());
    }
}

#[tokio::test]
async fn session_fails_when_every_worker_fails() {
    let host = Arc::new(FakeHost::new());
    let dht = FakeDht::new(5);
    // Nothing is reachable: every bootstrap dial is refused, no multicast.
    for record in &dht.bootstrap {
        host.refuse(record.peer_id);
    }
    let mdns = Arc::new(FakeMdns {
        mode: MdnsMode::Fail,
        records: vec![],
    });

    let supervisor = SessionSupervisor::receiver(
        1,
        test_config(),
        host.clone(),
        Arc::new(dht),
        mdns,
        Arc::new(FakeKeyExchange::accepting()),
    )
    .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .expect("session finished");
    match outcome {
        SessionOutcome::Failed(message) => {
            assert!(message.contains("all discovery workers failed"), "{message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn sender_session_authenticates_an_inbound_peer() {
    let receiver = PeerId::random();

    let host = Arc::new(FakeHost::new());
    let dht = Arc::new(FakeDht::new(5));
    let mdns = Arc::new(FakeMdns {
        mode: MdnsMode::Quiet,
        records: vec![],
    });

    let (auth_tx, auth_rx) = mpsc::unbounded_channel();
    let mut supervisor = SessionSupervisor::sender(
        1,
        test_config(),
        host.clone(),
        dht.clone(),
        mdns,
        auth_rx,
    )
    .unwrap();
    supervisor.start_discovery();
    let statuses = supervisor.status_handles();

    // A losing attacker first, then the real receiver passes the exchange.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = auth_tx.send(ResponderOutcome::Failed {
            peer_id: PeerId::random(),
        });
        let _ = auth_tx.send(ResponderOutcome::Authenticated {
            peer_id: receiver,
            shared_secret: [3u8; 32],
        });
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .expect("session finished");
    match outcome {
        SessionOutcome::Ready {
            peer_id,
            shared_secret,
        } => {
            assert_eq!(peer_id, receiver);
            assert_eq!(shared_secret, [3u8; 32]);
        }
        other => panic!("expected ready, got {other:?}"),
    }

    assert!(dht.provide_calls.load(Ordering::SeqCst) >= 2);
    for status in statuses {
        assert_eq!(status.stage(), Stage::Stopped, "{}", status.name());
    }
}

#[tokio::test]
async fn shutdown_cancels_a_roaming_session() {
    let host = Arc::new(FakeHost::new());
    let dht = Arc::new(FakeDht::new(5));
    let mdns = Arc::new(FakeMdns {
        mode: MdnsMode::Quiet,
        records: vec![],
    });

    let supervisor = SessionSupervisor::receiver(
        1,
        test_config(),
        host.clone(),
        dht,
        mdns,
        Arc::new(FakeKeyExchange::accepting()),
    )
    .unwrap();
    let cancel = supervisor.cancel_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .expect("session finished");
    assert!(matches!(outcome, SessionOutcome::Cancelled));

    // Nothing else is dialled once the session is down.
    let dials = host.connect_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(host.connect_calls.load(Ordering::SeqCst), dials);
}

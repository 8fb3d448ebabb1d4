use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datapeer_lib::channel::Responder;
use datapeer_lib::config::NodeSettings;
use datapeer_lib::error::{ErrorKind, ExchangeError, ProbeError};
use datapeer_lib::handlers::RequestDispatcher;
use datapeer_lib::memory::MemoryTransport;
use datapeer_lib::onboard::Outcome;
use datapeer_lib::peer::{PeerAddress, PeerId};
use datapeer_lib::protocol::{DatasetRef, Message, MessageType, PeerProfile, PROTOCOL_ID};
use datapeer_lib::repo::{MemRepo, Repo};
use datapeer_lib::storage::{FsRepo, FILE_PEERS};
use datapeer_lib::telemetry::Telemetry;
use datapeer_lib::transport::{Connection, Transport};
use datapeer_lib::Node;

fn profile(id: &str) -> PeerProfile {
    PeerProfile {
        id: PeerId::from(id),
        peername: format!("{}-name", id.to_lowercase()),
        created: 0,
        attributes: Default::default(),
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, 20], port))
}

/// Counts protocol queries per peer on top of the in-memory transport.
struct CountingTransport {
    inner: MemoryTransport,
    probes: Mutex<HashMap<PeerId, usize>>,
}

impl CountingTransport {
    fn probes(&self, id: &str) -> usize {
        self.probes
            .lock()
            .unwrap()
            .get(&PeerId::from(id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn dial(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, ExchangeError> {
        self.inner.dial(peer).await
    }

    async fn advertised_protocols(&self, peer: &PeerId) -> Result<Vec<String>, ProbeError> {
        *self.probes.lock().unwrap().entry(peer.clone()).or_default() += 1;
        self.inner.advertised_protocols(peer).await
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    Normal,
    SlowProfile,
    HangProfile,
    FailDatasets,
}

/// A remote peer: answers from its own repo and records what it was asked.
struct RemotePeer {
    dispatcher: RequestDispatcher,
    behavior: Behavior,
    seen: Mutex<Vec<MessageType>>,
}

impl RemotePeer {
    fn new(id: &str, behavior: Behavior) -> Arc<Self> {
        let repo = Arc::new(MemRepo::with_profile(profile(id)));
        for name in ["movies", "weather"] {
            repo.put_dataset(DatasetRef {
                peername: profile(id).peername,
                name: name.into(),
                path: format!("/mem/{}/{}", id, name),
            })
            .unwrap();
        }
        Arc::new(Self {
            dispatcher: RequestDispatcher::new(repo),
            behavior,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<MessageType> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for RemotePeer {
    async fn respond(&self, request: Message) -> Message {
        self.seen.lock().unwrap().push(request.msg_type);
        match (self.behavior, request.msg_type) {
            (Behavior::SlowProfile, MessageType::PeerInfo) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            (Behavior::HangProfile, MessageType::PeerInfo) => {
                std::future::pending::<()>().await;
            }
            (Behavior::FailDatasets, MessageType::DatasetList) => {
                return request.error_reply("datasets unavailable");
            }
            _ => {}
        }
        self.dispatcher.respond(request).await
    }
}

struct Harness {
    node: Node,
    memory: MemoryTransport,
    transport: Arc<CountingTransport>,
}

impl Harness {
    fn new(send_timeout: Duration) -> Self {
        let memory = MemoryTransport::new();
        let transport = Arc::new(CountingTransport {
            inner: memory.clone(),
            probes: Mutex::new(HashMap::new()),
        });
        let settings = NodeSettings {
            send_timeout,
            ..NodeSettings::default()
        };
        let node = Node::new(
            Arc::new(MemRepo::with_profile(profile("L"))),
            transport.clone(),
            settings,
            Arc::new(Telemetry::new()),
        )
        .unwrap();
        Self {
            node,
            memory,
            transport,
        }
    }

    fn add_remote(&self, id: &str, behavior: Behavior) -> Arc<RemotePeer> {
        let remote = RemotePeer::new(id, behavior);
        self.memory
            .add_peer(id, remote.clone(), vec![PROTOCOL_ID.to_string()]);
        remote
    }

    fn known(&self, id: &str) -> bool {
        self.node.registry().has_known_peer(&PeerId::from(id))
    }

    fn support(&self, id: &str) -> Option<bool> {
        self.node.registry().cached_support(&PeerId::from(id))
    }

    async fn wait_for_outcomes(&self, n: u64) {
        let telemetry = self.node.telemetry();
        for _ in 0..500 {
            if telemetry.total_outcomes() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} onboarding outcomes, saw {}",
            n,
            telemetry.total_outcomes()
        );
    }
}

#[tokio::test]
async fn test_discovered_peer_is_onboarded() {
    let h = Harness::new(Duration::from_secs(5));
    let remote = h.add_remote("A1", Behavior::Normal);

    let outcome = h.node.onboard(PeerAddress::new("A1", vec![addr(4001)])).await;

    assert_eq!(outcome, Outcome::Completed);
    assert!(h.known("A1"));
    assert_eq!(h.support("A1"), Some(true));
    assert_eq!(remote.seen(), vec![MessageType::PeerInfo, MessageType::DatasetList]);

    let listing = h
        .node
        .repo()
        .remote_datasets(&PeerId::from("A1"))
        .unwrap()
        .unwrap();
    assert_eq!(listing.len(), 2);

    let stored = h.node.repo().known_peer(&PeerId::from("A1")).unwrap().unwrap();
    assert_eq!(stored.profile.peername, "a1-name");
    assert_eq!(
        h.node.registry().addresses(&PeerId::from("A1")),
        vec![addr(4001)]
    );
}

#[tokio::test]
async fn test_duplicate_discovery_sends_one_exchange() {
    let h = Harness::new(Duration::from_secs(5));
    let remote = h.add_remote("A1", Behavior::SlowProfile);
    let adapter = h.node.start_discovery().unwrap();

    adapter.on_peer_found(PeerAddress::new("A1", vec![addr(4001)]));
    adapter.on_peer_found(PeerAddress::new("A1", vec![addr(4001)]));
    h.wait_for_outcomes(2).await;

    assert_eq!(remote.seen(), vec![MessageType::PeerInfo, MessageType::DatasetList]);
    let telemetry = h.node.telemetry();
    assert_eq!(telemetry.outcome_count(Outcome::Completed), 1);
    assert_eq!(telemetry.outcome_count(Outcome::AlreadyKnown), 1);
    assert_eq!(h.transport.probes("A1"), 1);

    // Later sightings stay no-ops.
    for _ in 0..3 {
        adapter.on_peer_found(PeerAddress::new("A1", vec![addr(4001)]));
    }
    h.wait_for_outcomes(5).await;
    assert_eq!(remote.seen().len(), 2);
    assert_eq!(telemetry.outcome_count(Outcome::AlreadyKnown), 4);
}

#[tokio::test]
async fn test_probe_error_is_not_cached() {
    let h = Harness::new(Duration::from_secs(5));
    let peer = PeerAddress::new("B", vec![addr(4002)]);

    assert_eq!(h.node.onboard(peer.clone()).await, Outcome::ProbeFailed);
    assert_eq!(h.support("B"), None);
    assert!(!h.known("B"));
    assert_eq!(h.node.telemetry().error_count(ErrorKind::Probe), 1);

    // B shows up properly on the next sighting and gets probed again.
    let remote = h.add_remote("B", Behavior::Normal);
    assert_eq!(h.node.onboard(peer).await, Outcome::Completed);
    assert_eq!(h.transport.probes("B"), 2);
    assert_eq!(remote.seen().len(), 2);
}

#[tokio::test]
async fn test_unreachable_probe_sends_nothing() {
    let h = Harness::new(Duration::from_secs(5));
    let remote = h.add_remote("B", Behavior::Normal);
    h.memory.set_reachable("B", false);

    let outcome = h.node.onboard(PeerAddress::new("B", vec![addr(4002)])).await;

    assert_eq!(outcome, Outcome::ProbeFailed);
    assert!(remote.seen().is_empty());
    assert_eq!(h.support("B"), None);
}

#[tokio::test]
async fn test_unsupported_peer_is_probed_once() {
    let h = Harness::new(Duration::from_secs(5));
    let remote = RemotePeer::new("C", Behavior::Normal);
    h.memory
        .add_peer("C", remote.clone(), vec!["/ipfs/id/1.0.0".to_string()]);

    for _ in 0..3 {
        let outcome = h.node.onboard(PeerAddress::new("C", vec![addr(4003)])).await;
        assert_eq!(outcome, Outcome::Unsupported);
    }

    assert_eq!(h.support("C"), Some(false));
    assert_eq!(h.transport.probes("C"), 1);
    assert!(remote.seen().is_empty());
    assert_eq!(h.memory.dial_count(&PeerId::from("C")), 0);
}

#[tokio::test]
async fn test_profile_timeout_skips_datasets() {
    let h = Harness::new(Duration::from_millis(200));
    let remote = h.add_remote("D", Behavior::HangProfile);

    let outcome = h.node.onboard(PeerAddress::new("D", vec![addr(4004)])).await;

    assert_eq!(outcome, Outcome::ProfileFailed);
    assert!(!h.known("D"));
    assert_eq!(remote.seen(), vec![MessageType::PeerInfo]);
    assert_eq!(h.node.telemetry().error_count(ErrorKind::Timeout), 1);
    // Supported is still true: the timeout says nothing about the protocol.
    assert_eq!(h.support("D"), Some(true));
}

#[tokio::test]
async fn test_dataset_failure_keeps_profile() {
    let h = Harness::new(Duration::from_secs(5));
    let remote = h.add_remote("E", Behavior::FailDatasets);

    let outcome = h.node.onboard(PeerAddress::new("E", vec![addr(4005)])).await;

    assert_eq!(outcome, Outcome::DatasetsFailed);
    assert!(h.known("E"));
    assert!(h
        .node
        .repo()
        .remote_datasets(&PeerId::from("E"))
        .unwrap()
        .is_none());
    assert_eq!(remote.seen(), vec![MessageType::PeerInfo, MessageType::DatasetList]);
    assert_eq!(h.node.telemetry().error_count(ErrorKind::Handler), 1);
}

#[tokio::test]
async fn test_timeout_does_not_stall_other_peers() {
    let h = Harness::new(Duration::from_millis(500));
    h.add_remote("D", Behavior::HangProfile);
    h.add_remote("A1", Behavior::Normal);
    let adapter = h.node.start_discovery().unwrap();

    adapter.on_peer_found(PeerAddress::new("D", vec![addr(4004)]));
    adapter.on_peer_found(PeerAddress::new("A1", vec![addr(4001)]));

    h.wait_for_outcomes(1).await;
    let telemetry = h.node.telemetry();
    assert_eq!(telemetry.outcome_count(Outcome::Completed), 1);
    assert!(h.known("A1"));
    assert!(!h.known("D"));

    h.wait_for_outcomes(2).await;
    assert_eq!(telemetry.outcome_count(Outcome::ProfileFailed), 1);
    assert_eq!(telemetry.error_count(ErrorKind::Timeout), 1);
}

#[tokio::test]
async fn test_remote_learns_our_profile() {
    let h = Harness::new(Duration::from_secs(5));
    let remote_repo = Arc::new(MemRepo::with_profile(profile("A1")));
    h.memory.add_peer(
        "A1",
        Arc::new(RequestDispatcher::new(remote_repo.clone())),
        vec![PROTOCOL_ID.to_string()],
    );

    h.node.onboard(PeerAddress::new("A1", vec![addr(4001)])).await;

    let learned = remote_repo.known_peer(&PeerId::from("L")).unwrap().unwrap();
    assert_eq!(learned.profile, profile("L"));
}

#[tokio::test]
async fn test_supported_peer_is_not_probed_again() {
    let h = Harness::new(Duration::from_millis(200));
    let remote = h.add_remote("D", Behavior::HangProfile);
    let peer = PeerAddress::new("D", vec![addr(4004)]);

    assert_eq!(h.node.onboard(peer.clone()).await, Outcome::ProfileFailed);
    assert_eq!(h.node.onboard(peer).await, Outcome::ProfileFailed);

    // Not known yet, so the second run goes past dedup but trusts the cached flag.
    assert_eq!(h.transport.probes("D"), 1);
    assert_eq!(remote.seen(), vec![MessageType::PeerInfo, MessageType::PeerInfo]);
}

#[tokio::test(start_paused = true)]
async fn test_addresses_stay_provisional_until_profile_answered() {
    let h = Harness::new(Duration::from_millis(200));
    h.add_remote("A1", Behavior::Normal);
    h.add_remote("D", Behavior::HangProfile);

    let a1 = PeerAddress::new("A1", vec![addr(4001)]);
    let d = PeerAddress::new("D", vec![addr(4004)]);
    assert_eq!(h.node.onboard(a1).await, Outcome::Completed);
    assert_eq!(h.node.onboard(d).await, Outcome::ProfileFailed);
    assert_eq!(h.node.registry().addresses(&PeerId::from("D")), vec![addr(4004)]);

    tokio::time::advance(Duration::from_secs(60)).await;

    let registry = h.node.registry();
    assert_eq!(registry.addresses(&PeerId::from("A1")), vec![addr(4001)]);
    assert!(registry.addresses(&PeerId::from("D")).is_empty());
}

#[tokio::test]
async fn test_unreadable_known_peers_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(FsRepo::open(dir.path()).unwrap());
    repo.set_local_profile(profile("L")).unwrap();
    std::fs::write(repo.path(FILE_PEERS), "{not json").unwrap();

    let memory = MemoryTransport::new();
    let remote = RemotePeer::new("A1", Behavior::Normal);
    memory.add_peer("A1", remote.clone(), vec![PROTOCOL_ID.to_string()]);
    let node = Node::new(
        repo,
        Arc::new(memory),
        NodeSettings::default(),
        Arc::new(Telemetry::new()),
    )
    .unwrap();

    let outcome = node.onboard(PeerAddress::new("A1", vec![addr(4001)])).await;

    assert_eq!(outcome, Outcome::ProfileFailed);
    let telemetry = node.telemetry();
    assert_eq!(telemetry.error_count(ErrorKind::Repo), 1);
    // Storing the answer fails on the same file.
    assert_eq!(telemetry.error_count(ErrorKind::Handler), 1);
    assert_eq!(remote.seen(), vec![MessageType::PeerInfo]);
}

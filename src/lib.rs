//! Local-network peer node: discovers peers over mDNS, checks that they speak
//! the datapeer protocol, and exchanges profiles and dataset listings with them.

pub mod analytics;
pub mod channel;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod memory;
pub mod onboard;
pub mod peer;
pub mod prober;
pub mod protocol;
pub mod repo;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod transport;

use anyhow::Context;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use analytics::Analytics;
use channel::{MessageChannel, Responder};
use config::NodeSettings;
use discovery::{spawn_mdns_notifier, Discovery, DiscoveryAdapter};
use error::{ExchangeError, HandlerError, NodeError, OnboardError, RepoError};
use handlers::{handle_profile_response, RequestDispatcher};
use onboard::{Onboarding, Outcome};
use peer::{PeerAddress, PeerId};
use prober::ProtocolProber;
use protocol::{Message, Payload, PeerProfile};
use repo::Repo;
use state::{lock, PeerRegistry};
use storage::{FsRepo, FILE_ANALYTICS};
use telemetry::Telemetry;
use transport::{QuicTransport, Transport};

/// One local node: registry, message channel and onboarding wired together.
pub struct Node {
    id: PeerId,
    settings: NodeSettings,
    repo: Arc<dyn Repo>,
    registry: Arc<PeerRegistry>,
    channel: Arc<MessageChannel>,
    onboarding: Arc<Onboarding>,
    telemetry: Arc<Telemetry>,
    dispatcher: Arc<RequestDispatcher>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// The node id comes from the repo's local profile, which must exist.
    pub fn new(
        repo: Arc<dyn Repo>,
        transport: Arc<dyn Transport>,
        settings: NodeSettings,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, RepoError> {
        let id = repo.local_profile()?.id;
        let registry = Arc::new(PeerRegistry::new(repo.clone()));
        let channel = Arc::new(MessageChannel::new(
            transport.clone(),
            settings.send_timeout,
        ));
        let prober = ProtocolProber::new(transport, settings.protocol_id.clone());
        let onboarding = Arc::new(Onboarding::new(
            registry.clone(),
            prober,
            channel.clone(),
            repo.clone(),
            telemetry.clone(),
            settings.clone(),
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(repo.clone()));

        Ok(Self {
            id,
            settings,
            repo,
            registry,
            channel,
            onboarding,
            telemetry,
            dispatcher,
            discovery: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn repo(&self) -> &Arc<dyn Repo> {
        &self.repo
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Handler for inbound requests, to hand to a transport listener.
    pub fn responder(&self) -> Arc<dyn Responder> {
        self.dispatcher.clone()
    }

    /// Starts the onboarding workers and returns the peer-found entry point.
    ///
    /// Only one discovery service runs per node; later calls fail.
    pub fn start_discovery(&self) -> Result<DiscoveryAdapter, NodeError> {
        let mut running = lock(&self.discovery);
        if running.is_some() {
            return Err(NodeError::DiscoveryAlreadyStarted);
        }
        let (adapter, worker) = discovery::spawn_workers(self.onboarding.clone());
        *running = Some(worker);
        tracing::info!(peer = %self.id, "discovery started");
        Ok(adapter)
    }

    /// Runs the onboarding pipeline for `peer` on the current task.
    pub async fn onboard(&self, peer: PeerAddress) -> Outcome {
        self.onboarding.onboard(peer).await
    }

    pub async fn send_message(
        &self,
        peer: &PeerAddress,
        msg: Message,
    ) -> Result<Message, ExchangeError> {
        self.channel.send_message(peer, msg).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.discovery).take() {
            worker.abort();
        }
    }
}

/// Returns the local profile, creating a fresh identity on first use.
pub fn ensure_local_profile(repo: &dyn Repo) -> Result<PeerProfile, RepoError> {
    match repo.local_profile() {
        Ok(profile) => Ok(profile),
        Err(RepoError::NotFound(_)) => {
            let peername = names::Generator::default()
                .next()
                .unwrap_or_else(|| "datapeer".to_string());
            let mut attributes = BTreeMap::new();
            if let Ok(host) = hostname::get() {
                attributes.insert("hostname".to_string(), host.to_string_lossy().to_string());
            }
            let profile = PeerProfile {
                id: PeerId::random(),
                peername,
                created: crate::repo::now_secs(),
                attributes,
            };
            repo.set_local_profile(profile.clone())?;
            tracing::info!(peer = %profile.id, peername = %profile.peername, "created local profile");
            Ok(profile)
        }
        Err(e) => Err(e),
    }
}

/// Runs a node until Ctrl+C: QUIC listener, mDNS announce/browse, onboarding.
pub async fn serve(repo_dir: &Path, port: u16, settings: NodeSettings) -> anyhow::Result<()> {
    let repo = Arc::new(
        FsRepo::open(repo_dir)
            .with_context(|| format!("failed to open repo at {}", repo_dir.display()))?,
    );
    let profile = ensure_local_profile(repo.as_ref())?;

    let analytics = Arc::new(Analytics::new(repo.path(FILE_ANALYTICS)));
    let telemetry = Arc::new(Telemetry::new().with_event_log(analytics.clone()));

    let transport = QuicTransport::new(port)?;
    let local_addr = transport.local_addr()?;
    tracing::info!(peer = %profile.id, peername = %profile.peername, %local_addr, "QUIC transport listening");

    let node = Node::new(
        repo.clone(),
        Arc::new(transport.clone()),
        settings,
        telemetry,
    )?;
    let listener = transport.start_listening(node.responder());

    let mut discovery = Discovery::new()?;
    discovery.register(
        node.id(),
        local_addr.port(),
        &[node.settings().protocol_id.clone()],
    )?;
    let events = discovery.browse()?;
    let adapter = node.start_discovery()?;
    let notifier = spawn_mdns_notifier(
        events,
        node.id().clone(),
        transport.protocols().clone(),
        adapter,
    );

    let registry = node.registry().clone();
    let prune_every = node.settings().address_ttl.max(Duration::from_secs(1));
    let pruner = tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_every);
        loop {
            interval.tick().await;
            registry.prune();
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    notifier.abort();
    pruner.abort();
    listener.abort();
    transport.close();
    drop(discovery);
    if let Err(e) = analytics.flush() {
        tracing::warn!(error = %e, "failed to flush analytics");
    }
    Ok(())
}

/// Dials `addr` directly and exchanges profiles, skipping discovery and probing.
///
/// The remote's profile is stored as a known peer under the id it reports.
pub async fn connect_peer(
    repo: &dyn Repo,
    channel: &MessageChannel,
    addr: SocketAddr,
) -> Result<PeerProfile, OnboardError> {
    // The real id is unknown until the remote answers.
    let target = PeerAddress::new(PeerId::new(addr.to_string()), vec![addr]);
    let reply = channel
        .send_message(&target, Message::peer_info(repo.local_profile()?))
        .await?;

    let profile = match &reply.payload {
        Payload::Profile(profile) => profile.clone(),
        _ => {
            // Reports the remote error or the unexpected payload.
            handle_profile_response(repo, &target.id, &reply)?;
            return Err(HandlerError::UnexpectedPayload {
                msg_type: reply.msg_type,
                payload: reply.payload.kind(),
            }
            .into());
        }
    };
    handle_profile_response(repo, &profile.id, &reply)?;
    tracing::info!(peer = %profile.id, %addr, "connected to peer");
    Ok(profile)
}

/// One-shot `peers connect`: binds an ephemeral QUIC endpoint and dials `addr`.
pub async fn connect(
    repo_dir: &Path,
    addr: SocketAddr,
    timeout: Duration,
) -> anyhow::Result<PeerProfile> {
    let repo = FsRepo::open(repo_dir)
        .with_context(|| format!("failed to open repo at {}", repo_dir.display()))?;
    ensure_local_profile(&repo)?;

    let transport = QuicTransport::new(0)?;
    let channel = MessageChannel::new(Arc::new(transport.clone()), timeout);
    let result = connect_peer(&repo, &channel, addr).await;
    transport.close();
    result.with_context(|| format!("failed to connect to {}", addr))
}

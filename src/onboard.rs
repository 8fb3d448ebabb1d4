//! Onboarding pipeline: one run per peer-found event.
//!
//! Discovered -> dedup check -> support check -> registering ->
//! profile exchange -> dataset exchange -> done. Every failure ends the run
//! for that peer only; nothing is rolled back.
//!
//! Addresses stay provisional (`provisional_ttl`) until the peer has answered
//! a profile exchange, then live for `address_ttl`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::MessageChannel;
use crate::config::NodeSettings;
use crate::error::{OnboardError, ProbeError};
use crate::handlers::{handle_datasets_response, handle_profile_response};
use crate::peer::{PeerAddress, PeerId};
use crate::prober::ProtocolProber;
use crate::protocol::Message;
use crate::repo::Repo;
use crate::state::PeerRegistry;
use crate::telemetry::{Stage, Telemetry};

/// Where a pipeline run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A known peer record already exists.
    AlreadyKnown,
    /// Probed (now or earlier) and found not to speak the protocol.
    Unsupported,
    /// The support query failed; nothing was cached.
    ProbeFailed,
    /// No profile was persisted.
    ProfileFailed,
    /// Profile persisted, dataset listing missing.
    DatasetsFailed,
    Completed,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::AlreadyKnown,
        Outcome::Unsupported,
        Outcome::ProbeFailed,
        Outcome::ProfileFailed,
        Outcome::DatasetsFailed,
        Outcome::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::AlreadyKnown => "already_known",
            Outcome::Unsupported => "unsupported",
            Outcome::ProbeFailed => "probe_failed",
            Outcome::ProfileFailed => "profile_failed",
            Outcome::DatasetsFailed => "datasets_failed",
            Outcome::Completed => "completed",
        }
    }
}

pub struct Onboarding {
    registry: Arc<PeerRegistry>,
    prober: ProtocolProber,
    channel: Arc<MessageChannel>,
    repo: Arc<dyn Repo>,
    telemetry: Arc<Telemetry>,
    settings: NodeSettings,
}

impl Onboarding {
    pub fn new(
        registry: Arc<PeerRegistry>,
        prober: ProtocolProber,
        channel: Arc<MessageChannel>,
        repo: Arc<dyn Repo>,
        telemetry: Arc<Telemetry>,
        settings: NodeSettings,
    ) -> Self {
        Self {
            registry,
            prober,
            channel,
            repo,
            telemetry,
            settings,
        }
    }

    pub async fn onboard(&self, peer: PeerAddress) -> Outcome {
        self.registry
            .record_addresses(&peer.id, &peer.addrs, self.settings.provisional_ttl);

        // Held until the run ends so duplicate events for this peer queue up
        // behind it and then hit the dedup check.
        let _guard = self.registry.lock_peer(&peer.id).await;
        let outcome = self.run(&peer).await;
        self.telemetry.record_outcome(&peer.id, outcome);
        outcome
    }

    async fn run(&self, peer: &PeerAddress) -> Outcome {
        match self.registry.check_known(&peer.id) {
            Ok(true) => {
                self.confirm_addresses(&peer.id, &peer.addrs);
                return Outcome::AlreadyKnown;
            }
            Ok(false) => {}
            // Carry on as if unknown; a broken repo will fail the profile step too.
            Err(e) => self.report(peer, Stage::Dedup, e.into()),
        }

        match self.check_support(peer).await {
            Ok(true) => {}
            Ok(false) => return Outcome::Unsupported,
            Err(e) => {
                self.report(peer, Stage::Probe, e.into());
                return Outcome::ProbeFailed;
            }
        }

        self.registry
            .record_addresses(&peer.id, &peer.addrs, self.settings.provisional_ttl);
        let target = self.dial_target(peer);

        if let Err(e) = self.exchange_profile(&target).await {
            self.report(peer, Stage::Profile, e);
            return Outcome::ProfileFailed;
        }
        self.confirm_addresses(&peer.id, &target.addrs);
        if let Err(e) = self.exchange_datasets(&target).await {
            self.report(peer, Stage::Datasets, e);
            return Outcome::DatasetsFailed;
        }
        tracing::info!(peer = %peer.id, "peer onboarded");
        Outcome::Completed
    }

    async fn check_support(&self, peer: &PeerAddress) -> Result<bool, ProbeError> {
        if let Some(supported) = self.registry.cached_support(&peer.id) {
            return Ok(supported);
        }
        let supported = self.prober.supports_protocol(peer).await?;
        self.registry.set_support_flag(&peer.id, supported);
        tracing::debug!(peer = %peer.id, supported, "probed protocol support");
        Ok(supported)
    }

    fn confirm_addresses(&self, id: &PeerId, addrs: &[SocketAddr]) {
        self.registry
            .record_addresses(id, addrs, self.settings.address_ttl);
    }

    // Every live address we know for the peer, not only the ones in this event.
    fn dial_target(&self, peer: &PeerAddress) -> PeerAddress {
        let addrs = self.registry.addresses(&peer.id);
        if addrs.is_empty() {
            peer.clone()
        } else {
            PeerAddress {
                id: peer.id.clone(),
                addrs,
            }
        }
    }

    async fn exchange_profile(&self, peer: &PeerAddress) -> Result<(), OnboardError> {
        let profile = self.repo.local_profile()?;
        let reply = self
            .channel
            .send_message(peer, Message::peer_info(profile))
            .await?;
        handle_profile_response(self.repo.as_ref(), &peer.id, &reply)?;
        Ok(())
    }

    async fn exchange_datasets(&self, peer: &PeerAddress) -> Result<(), OnboardError> {
        let request = Message::dataset_list(self.settings.datasets_limit, 0);
        let reply = self.channel.send_message(peer, request).await?;
        let count = handle_datasets_response(self.repo.as_ref(), &peer.id, &reply)?;
        tracing::debug!(peer = %peer.id, count, "recorded remote datasets");
        Ok(())
    }

    fn report(&self, peer: &PeerAddress, stage: Stage, err: OnboardError) {
        self.telemetry.report_error(&peer.id, stage, &err);
    }
}

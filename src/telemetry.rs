//! Observability sink for onboarding: counters by error kind and outcome,
//! structured log events, and an optional persistent event log.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ErrorKind, OnboardError, RepoError};
use crate::onboard::Outcome;
use crate::peer::PeerId;

/// Somewhere to append named events.
pub trait EventLog: Send + Sync {
    fn track(&self, event: &str, props: serde_json::Value) -> Result<(), RepoError>;
}

/// Pipeline stage an error was caught at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dedup,
    Probe,
    Profile,
    Datasets,
}

#[derive(Default)]
pub struct Telemetry {
    errors: [AtomicU64; ErrorKind::ALL.len()],
    outcomes: [AtomicU64; Outcome::ALL.len()],
    events: Option<Arc<dyn EventLog>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn report_error(&self, peer: &PeerId, stage: Stage, err: &OnboardError) {
        let kind = err.kind();
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
        match kind {
            ErrorKind::ProtocolViolation => tracing::error!(
                peer = %peer,
                ?stage,
                kind = kind.as_str(),
                error = %err,
                "peer violated the message protocol"
            ),
            _ => tracing::warn!(
                peer = %peer,
                ?stage,
                kind = kind.as_str(),
                error = %err,
                "onboarding stage failed"
            ),
        }
    }

    pub fn record_outcome(&self, peer: &PeerId, outcome: Outcome) {
        self.outcomes[outcome as usize].fetch_add(1, Ordering::Relaxed);
        tracing::debug!(peer = %peer, outcome = outcome.as_str(), "onboarding finished");

        if let Some(events) = &self.events {
            let props = json!({ "peer": peer.as_str(), "outcome": outcome.as_str() });
            if let Err(e) = events.track("peer_onboarding", props) {
                tracing::warn!(error = %e, "failed to track onboarding event");
            }
        }
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome as usize].load(Ordering::Relaxed)
    }

    pub fn total_outcomes(&self) -> u64 {
        Outcome::ALL.iter().map(|o| self.outcome_count(*o)).sum()
    }
}

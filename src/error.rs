//! Error taxonomy for discovery, probing and message exchange.
//!
//! Every error maps onto an [`ErrorKind`] so the telemetry sink can count
//! failures without caring where they came from.

use std::time::Duration;
use thiserror::Error;

use crate::peer::PeerId;
use crate::protocol::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Timeout,
    ProtocolViolation,
    Probe,
    Handler,
    Repo,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::ProtocolViolation,
        ErrorKind::Probe,
        ErrorKind::Handler,
        ErrorKind::Repo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::Probe => "probe",
            ErrorKind::Handler => "handler",
            ErrorKind::Repo => "repo",
        }
    }
}

/// Failure of a single request/response exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("connection to {peer} failed: {reason}")]
    Connection { peer: PeerId, reason: String },

    #[error("no reply from {peer} within {timeout:?}")]
    Timeout { peer: PeerId, timeout: Duration },

    #[error("protocol violation by {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: String },
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Connection { .. } => ErrorKind::Connection,
            ExchangeError::Timeout { .. } => ErrorKind::Timeout,
            ExchangeError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
        }
    }
}

/// The protocol-support query itself failed; never cached.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no protocol record for peer {0}")]
    UnknownPeer(PeerId),

    #[error("protocol lookup for {peer} failed: {reason}")]
    Lookup { peer: PeerId, reason: String },
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repo io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repo encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),
}

/// A request or response handler could not process its payload.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("unexpected {payload} payload for {msg_type:?}")]
    UnexpectedPayload {
        msg_type: MessageType,
        payload: &'static str,
    },

    #[error("{peer} answered {msg_type:?} with an error: {message}")]
    Remote {
        peer: PeerId,
        msg_type: MessageType,
        message: String,
    },
}

/// Why an onboarding pipeline stopped early.
#[derive(Debug, Error)]
pub enum OnboardError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("local repo unavailable: {0}")]
    Repo(#[from] RepoError),
}

impl OnboardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OnboardError::Probe(_) => ErrorKind::Probe,
            OnboardError::Exchange(e) => e.kind(),
            OnboardError::Handler(_) => ErrorKind::Handler,
            OnboardError::Repo(_) => ErrorKind::Repo,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("discovery already started")]
    DiscoveryAlreadyStarted,
}

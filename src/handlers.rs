//! Request and response handlers for the fixed set of message types.

use async_trait::async_trait;
use std::sync::Arc;

use crate::channel::Responder;
use crate::error::HandlerError;
use crate::peer::PeerId;
use crate::protocol::{Message, MessagePhase, MessageType, Payload};
use crate::repo::Repo;

/// Largest dataset page a remote may ask for.
pub const MAX_DATASETS_PAGE: usize = 100;

/// Answers inbound requests from the local repo.
pub struct RequestDispatcher {
    repo: Arc<dyn Repo>,
}

impl RequestDispatcher {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo }
    }

    fn handle(&self, request: &Message) -> Result<Payload, HandlerError> {
        match request.msg_type {
            MessageType::PeerInfo => self.peer_info(request),
            MessageType::DatasetList => self.dataset_list(request),
        }
    }

    // Remember who asked, then introduce ourselves.
    fn peer_info(&self, request: &Message) -> Result<Payload, HandlerError> {
        let Payload::Profile(profile) = &request.payload else {
            return Err(unexpected(request));
        };
        self.repo.put_known_peer(&profile.id, profile.clone())?;
        Ok(Payload::Profile(self.repo.local_profile()?))
    }

    fn dataset_list(&self, request: &Message) -> Result<Payload, HandlerError> {
        let Payload::DatasetsParams(params) = &request.payload else {
            return Err(unexpected(request));
        };
        let limit = params.limit.min(MAX_DATASETS_PAGE);
        Ok(Payload::Datasets(
            self.repo.list_datasets(limit, params.offset)?,
        ))
    }
}

#[async_trait]
impl Responder for RequestDispatcher {
    async fn respond(&self, request: Message) -> Message {
        match self.handle(&request) {
            Ok(payload) => request.response(payload),
            Err(e) => {
                tracing::warn!(msg_type = ?request.msg_type, error = %e, "request handler failed");
                request.error_reply(e.to_string())
            }
        }
    }
}

fn unexpected(msg: &Message) -> HandlerError {
    HandlerError::UnexpectedPayload {
        msg_type: msg.msg_type,
        payload: msg.payload.kind(),
    }
}

fn remote_failure(peer: &PeerId, reply: &Message) -> Option<HandlerError> {
    if reply.phase != MessagePhase::Error {
        return None;
    }
    let message = match &reply.payload {
        Payload::Error { message } => message.clone(),
        other => other.kind().to_string(),
    };
    Some(HandlerError::Remote {
        peer: peer.clone(),
        msg_type: reply.msg_type,
        message,
    })
}

/// Persists the remote profile from a `PeerInfo` reply as a known peer.
pub fn handle_profile_response(
    repo: &dyn Repo,
    peer: &PeerId,
    reply: &Message,
) -> Result<(), HandlerError> {
    if let Some(err) = remote_failure(peer, reply) {
        return Err(err);
    }
    let Payload::Profile(profile) = &reply.payload else {
        return Err(unexpected(reply));
    };
    if &profile.id != peer {
        tracing::debug!(peer = %peer, announced = %profile.id, "profile id differs from discovered id");
    }
    repo.put_known_peer(peer, profile.clone())?;
    Ok(())
}

/// Records the listing from a `DatasetList` reply; returns how many entries it held.
pub fn handle_datasets_response(
    repo: &dyn Repo,
    peer: &PeerId,
    reply: &Message,
) -> Result<usize, HandlerError> {
    if let Some(err) = remote_failure(peer, reply) {
        return Err(err);
    }
    let Payload::Datasets(listing) = &reply.payload else {
        return Err(unexpected(reply));
    };
    let count = listing.len();
    repo.record_remote_datasets(peer, listing.clone())?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DatasetRef, PeerProfile};
    use crate::repo::MemRepo;

    fn profile(id: &str) -> PeerProfile {
        PeerProfile {
            id: PeerId::from(id),
            peername: id.to_lowercase(),
            created: 0,
            attributes: Default::default(),
        }
    }

    fn dataset(i: usize) -> DatasetRef {
        DatasetRef {
            peername: "local".into(),
            name: format!("ds{}", i),
            path: format!("/mem/ds{}", i),
        }
    }

    #[tokio::test]
    async fn test_dataset_request_is_clamped() {
        let repo = Arc::new(MemRepo::with_profile(profile("L")));
        for i in 0..150 {
            repo.put_dataset(dataset(i)).unwrap();
        }
        let dispatcher = RequestDispatcher::new(repo);

        let reply = dispatcher.respond(Message::dataset_list(500, 10)).await;
        let Payload::Datasets(list) = reply.payload else {
            panic!("expected datasets");
        };
        assert_eq!(list.len(), MAX_DATASETS_PAGE);
        assert_eq!(list[0].name, "ds10");
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_reply() {
        let dispatcher = RequestDispatcher::new(Arc::new(MemRepo::new()));
        let request = Message::peer_info(profile("R"));
        let reply = dispatcher.respond(request.clone()).await;
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.phase, MessagePhase::Error);
        assert!(matches!(reply.payload, Payload::Error { ref message } if message.contains("not found")));
    }

    #[test]
    fn test_error_reply_is_not_persisted() {
        let repo = MemRepo::new();
        let peer = PeerId::from("E");
        let reply = Message::dataset_list(30, 0).error_reply("disk full");

        let err = handle_datasets_response(&repo, &peer, &reply).unwrap_err();
        assert!(matches!(err, HandlerError::Remote { ref message, .. } if message == "disk full"));
        assert!(repo.remote_datasets(&peer).unwrap().is_none());
    }

    #[test]
    fn test_profile_response_creates_known_peer() {
        let repo = MemRepo::new();
        let peer = PeerId::from("A1");
        let reply = Message::peer_info(profile("L")).response(Payload::Profile(profile("A1")));

        handle_profile_response(&repo, &peer, &reply).unwrap();
        let known = repo.known_peer(&peer).unwrap().unwrap();
        assert_eq!(known.profile.peername, "a1");
    }
}

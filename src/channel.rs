//! Request/response exchange over a single peer connection.
//!
//! Each request travels on its own bidirectional stream: the caller writes one
//! frame and finishes, the remote writes exactly one terminal frame back.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::ExchangeError;
use crate::peer::{PeerAddress, PeerId};
use crate::protocol::{frame_codec, Message, MessagePhase};
use crate::state::{instant_after, lock};
use crate::transport::{Connection, Transport};

/// Answers an inbound request with its terminal reply.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: Message) -> Message;
}

pub struct MessageChannel {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    connections: Mutex<HashMap<PeerId, Arc<dyn Connection>>>,
}

impl MessageChannel {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `msg` and waits for its terminal reply (`Response` or `Error` phase).
    ///
    /// The whole exchange, dialing included, shares one deadline.
    pub async fn send_message(
        &self,
        peer: &PeerAddress,
        msg: Message,
    ) -> Result<Message, ExchangeError> {
        let deadline = instant_after(self.timeout);
        let result = match tokio::time::timeout_at(deadline, self.exchange(peer, &msg)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout {
                peer: peer.id.clone(),
                timeout: self.timeout,
            }),
        };

        match result {
            Ok(reply) => {
                check_reply(&peer.id, &msg, &reply)?;
                Ok(reply)
            }
            Err(e) => {
                if !matches!(e, ExchangeError::ProtocolViolation { .. }) {
                    self.forget(&peer.id);
                }
                Err(e)
            }
        }
    }

    /// Drops the cached connection for `id`; the next send dials again.
    pub fn forget(&self, id: &PeerId) {
        lock(&self.connections).remove(id);
    }

    async fn connection(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, ExchangeError> {
        let cached = lock(&self.connections).get(&peer.id).cloned();
        if let Some(conn) = cached {
            if !conn.is_closed() {
                return Ok(conn);
            }
        }
        let conn = self.transport.dial(peer).await?;
        lock(&self.connections).insert(peer.id.clone(), conn.clone());
        Ok(conn)
    }

    async fn exchange(&self, peer: &PeerAddress, msg: &Message) -> Result<Message, ExchangeError> {
        let conn = self.connection(peer).await?;
        let (send, recv) = conn
            .open_stream()
            .await
            .map_err(|e| stream_error(&peer.id, e))?;

        let frame = msg
            .encode()
            .map_err(|e| violation(&peer.id, format!("unencodable request: {}", e)))?;
        let mut writer = FramedWrite::new(send, frame_codec());
        writer
            .send(frame)
            .await
            .map_err(|e| stream_error(&peer.id, e))?;
        writer
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| stream_error(&peer.id, e))?;

        let mut reader = FramedRead::new(recv, frame_codec());
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(stream_error(&peer.id, e)),
            None => return Err(violation(&peer.id, "stream closed without a reply")),
        };
        Message::decode(&frame).map_err(|e| violation(&peer.id, format!("undecodable reply: {}", e)))
    }
}

fn violation(peer: &PeerId, reason: impl Into<String>) -> ExchangeError {
    ExchangeError::ProtocolViolation {
        peer: peer.clone(),
        reason: reason.into(),
    }
}

// Oversized or corrupt frames surface as InvalidData from the codec.
fn stream_error(peer: &PeerId, e: io::Error) -> ExchangeError {
    if e.kind() == io::ErrorKind::InvalidData {
        violation(peer, e.to_string())
    } else {
        ExchangeError::Connection {
            peer: peer.clone(),
            reason: e.to_string(),
        }
    }
}

fn check_reply(peer: &PeerId, request: &Message, reply: &Message) -> Result<(), ExchangeError> {
    if reply.msg_type != request.msg_type {
        return Err(violation(
            peer,
            format!(
                "expected {:?} reply, got {:?}",
                request.msg_type, reply.msg_type
            ),
        ));
    }
    if reply.id != request.id {
        return Err(violation(peer, "reply answers a different request"));
    }
    if reply.phase == MessagePhase::Request {
        return Err(violation(peer, "peer replied with a request"));
    }
    reply.validate().map_err(|reason| violation(peer, reason))
}

/// Serves one inbound stream: read a request, write its reply, finish.
///
/// Undecodable frames and non-request messages are logged and dropped.
pub async fn serve_stream<W, R>(send: W, recv: R, responder: &dyn Responder)
where
    W: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    let mut reader = FramedRead::new(recv, frame_codec());
    let frame = match reader.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "failed to read request frame");
            return;
        }
        None => return,
    };

    let request = match Message::decode(&frame) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "dropping undecodable request");
            return;
        }
    };
    if request.phase != MessagePhase::Request {
        tracing::warn!(
            msg_type = ?request.msg_type,
            phase = ?request.phase,
            "dropping unsolicited non-request message"
        );
        return;
    }

    let reply = match request.validate() {
        Ok(()) => responder.respond(request).await,
        Err(reason) => request.error_reply(reason),
    };

    let frame = match reply.encode() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode reply");
            return;
        }
    };
    let mut writer = FramedWrite::new(send, frame_codec());
    if let Err(e) = writer.send(frame).await {
        tracing::debug!(error = %e, "failed to write reply");
        return;
    }
    let _ = writer.get_mut().shutdown().await;
}

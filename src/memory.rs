//! In-process transport: peers are responders reachable over `tokio::io::duplex` pipes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::channel::{serve_stream, Responder};
use crate::error::{ExchangeError, ProbeError};
use crate::peer::{PeerAddress, PeerId};
use crate::state::lock;
use crate::transport::{Connection, RecvHalf, SendHalf, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

struct MemoryPeer {
    responder: Arc<dyn Responder>,
    protocols: Vec<String>,
    reachable: bool,
    dials: usize,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    peers: Arc<Mutex<HashMap<PeerId, MemoryPeer>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(
        &self,
        id: impl Into<PeerId>,
        responder: Arc<dyn Responder>,
        protocols: Vec<String>,
    ) {
        let peer = MemoryPeer {
            responder,
            protocols,
            reachable: true,
            dials: 0,
        };
        lock(&self.peers).insert(id.into(), peer);
    }

    /// An unreachable peer refuses dials and protocol queries.
    pub fn set_reachable(&self, id: impl Into<PeerId>, reachable: bool) {
        if let Some(peer) = lock(&self.peers).get_mut(&id.into()) {
            peer.reachable = reachable;
        }
    }

    pub fn dial_count(&self, id: &PeerId) -> usize {
        lock(&self.peers).get(id).map(|p| p.dials).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, peer: &PeerAddress) -> Result<Arc<dyn Connection>, ExchangeError> {
        let mut peers = lock(&self.peers);
        let reason = match peers.get_mut(&peer.id) {
            Some(p) if p.reachable => {
                p.dials += 1;
                return Ok(Arc::new(MemoryConnection {
                    responder: p.responder.clone(),
                }));
            }
            Some(_) => "peer unreachable",
            None => "no such peer",
        };
        Err(ExchangeError::Connection {
            peer: peer.id.clone(),
            reason: reason.to_string(),
        })
    }

    async fn advertised_protocols(&self, peer: &PeerId) -> Result<Vec<String>, ProbeError> {
        match lock(&self.peers).get(peer) {
            Some(p) if p.reachable => Ok(p.protocols.clone()),
            Some(_) => Err(ProbeError::Lookup {
                peer: peer.clone(),
                reason: "peer unreachable".into(),
            }),
            None => Err(ProbeError::UnknownPeer(peer.clone())),
        }
    }
}

struct MemoryConnection {
    responder: Arc<dyn Responder>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_stream(&self) -> io::Result<(SendHalf, RecvHalf)> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_read, server_write) = tokio::io::split(server);
        let responder = self.responder.clone();
        tokio::spawn(async move {
            serve_stream(server_write, server_read, responder.as_ref()).await;
        });
        let (client_read, client_write) = tokio::io::split(client);
        Ok((Box::new(client_write), Box::new(client_read)))
    }

    fn is_closed(&self) -> bool {
        false
    }
}

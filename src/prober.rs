use std::sync::Arc;

use crate::error::ProbeError;
use crate::peer::PeerAddress;
use crate::transport::Transport;

/// Checks whether a peer advertises the application protocol.
pub struct ProtocolProber {
    transport: Arc<dyn Transport>,
    protocol_id: String,
}

impl ProtocolProber {
    pub fn new(transport: Arc<dyn Transport>, protocol_id: impl Into<String>) -> Self {
        Self {
            transport,
            protocol_id: protocol_id.into(),
        }
    }

    /// `Ok(false)` is a definite "unsupported"; `Err` means the answer is unknown.
    pub async fn supports_protocol(&self, peer: &PeerAddress) -> Result<bool, ProbeError> {
        let protocols = self.transport.advertised_protocols(&peer.id).await?;
        tracing::trace!(peer = %peer.id, ?protocols, "peer protocols");
        Ok(protocols.iter().any(|p| *p == self.protocol_id))
    }
}

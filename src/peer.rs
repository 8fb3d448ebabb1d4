use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Stable identifier a node announces over mDNS and inside its profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A peer identifier together with the addresses it was seen at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddress {
    pub fn new(id: impl Into<PeerId>, addrs: Vec<SocketAddr>) -> Self {
        Self {
            id: id.into(),
            addrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::from("A1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"A1\"");
        assert_eq!(id.to_string(), "A1");
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}

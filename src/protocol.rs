use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::codec::LengthDelimitedCodec;
use uuid::Uuid;

use crate::peer::PeerId;

/// Protocol identifier advertised over mDNS and negotiated as the QUIC ALPN.
pub const PROTOCOL_ID: &str = "/datapeer/0.1.0";

/// Largest frame either side will accept (10MB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024 * 10;

/// Profile record a node shares about itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerProfile {
    pub id: PeerId,
    pub peername: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// One entry of a dataset listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetRef {
    pub peername: String,
    pub name: String,
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetsReqParams {
    pub limit: usize,
    pub offset: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PeerInfo,
    DatasetList,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagePhase {
    Request,
    Response,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "data")]
pub enum Payload {
    Profile(PeerProfile),
    DatasetsParams(DatasetsReqParams),
    Datasets(Vec<DatasetRef>),
    Error { message: String },
}

/// Unit of exchange. A reply carries the `id` of the request it answers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub phase: MessagePhase,
    pub payload: Payload,
}

impl Message {
    pub fn request(msg_type: MessageType, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type,
            phase: MessagePhase::Request,
            payload,
        }
    }

    pub fn peer_info(profile: PeerProfile) -> Self {
        Self::request(MessageType::PeerInfo, Payload::Profile(profile))
    }

    pub fn dataset_list(limit: usize, offset: usize) -> Self {
        Self::request(
            MessageType::DatasetList,
            Payload::DatasetsParams(DatasetsReqParams { limit, offset }),
        )
    }

    pub fn response(&self, payload: Payload) -> Self {
        Self {
            id: self.id,
            msg_type: self.msg_type,
            phase: MessagePhase::Response,
            payload,
        }
    }

    pub fn error_reply(&self, message: impl Into<String>) -> Self {
        Self {
            id: self.id,
            msg_type: self.msg_type,
            phase: MessagePhase::Error,
            payload: Payload::Error {
                message: message.into(),
            },
        }
    }

    /// Checks that the payload variant is the one `(msg_type, phase)` calls for.
    pub fn validate(&self) -> Result<(), String> {
        let ok = match (self.msg_type, self.phase, &self.payload) {
            (_, MessagePhase::Error, Payload::Error { .. }) => true,
            (MessageType::PeerInfo, MessagePhase::Request, Payload::Profile(_)) => true,
            (MessageType::PeerInfo, MessagePhase::Response, Payload::Profile(_)) => true,
            (MessageType::DatasetList, MessagePhase::Request, Payload::DatasetsParams(_)) => true,
            (MessageType::DatasetList, MessagePhase::Response, Payload::Datasets(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "payload {} does not match {:?}/{:?}",
                self.payload.kind(),
                self.msg_type,
                self.phase
            ))
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Profile(_) => "Profile",
            Payload::DatasetsParams(_) => "DatasetsParams",
            Payload::Datasets(_) => "Datasets",
            Payload::Error { .. } => "Error",
        }
    }
}

/// Length-prefixed framing shared by both ends of a stream.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

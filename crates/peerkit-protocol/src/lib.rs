//! Wire types for the PeerKit signaling protocol.
//!
//! Every frame on the socket is a JSON object carrying a `type` discriminator.
//! Client frames are decoded in two steps so that an unknown `type` can be
//! told apart from a broken frame: the former is ignored by the server, the
//! latter is dropped with a diagnostic.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame types a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] =
    &["REPORT", "REQUEST", "CONN", "RESPONSE", "INVALID", "SERVED"];

/// One half-open byte range `[start, end)` of a resource and its SHA-256 digest.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ChunkDescriptor {
    pub start: u64,
    pub end: u64,
    /// Lowercase hex SHA-256 of the bytes in `[start, end)`.
    #[serde(rename = "contentHash")]
    pub hash: String,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Verified content layout of a resource.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ChunkManifest {
    pub url: String,
    pub size: u64,
    pub chunks: Vec<ChunkDescriptor>,
}

/// The `file` member of a resource answer: the manifest when the resource is
/// known, a bare `{url}` placeholder otherwise.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ResourceFile {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkDescriptor>>,
}

impl ResourceFile {
    pub fn placeholder(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size: None,
            chunks: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.size.is_none() && self.chunks.is_none()
    }
}

impl From<&ChunkManifest> for ResourceFile {
    fn from(manifest: &ChunkManifest) -> Self {
        Self {
            url: manifest.url.clone(),
            size: Some(manifest.size),
            chunks: Some(manifest.chunks.clone()),
        }
    }
}

/// A pooled connection offer handed to a requester, tagged with its owner.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct PeerOffer {
    pub data: Value,
    pub id: String,
}

/// Answer to a resource lookup, shared by the socket and polling surfaces.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ResourceView {
    pub file: ResourceFile,
    pub peers: Vec<PeerOffer>,
}

impl ResourceView {
    pub fn unknown(url: impl Into<String>) -> Self {
        Self {
            file: ResourceFile::placeholder(url),
            peers: Vec::new(),
        }
    }
}

/// Body of the polling endpoint, keyed by requested URL.
pub type PollResponse = BTreeMap<String, ResourceView>;

/// Client to server frames.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// The sender holds the resource at `url`.
    #[serde(rename = "REPORT")]
    Report { url: String },
    /// The sender wants holders of `url`.
    #[serde(rename = "REQUEST")]
    Request { url: String },
    /// A connection offer other peers may use to reach the sender.
    #[serde(rename = "CONN")]
    Conn { conn: Value },
    /// Answer payload to be relayed to client `id`.
    #[serde(rename = "RESPONSE")]
    Response { id: String, data: Value },
    /// Client `id` served bad content for `url`.
    #[serde(rename = "INVALID")]
    Invalid {
        id: String,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename = "SERVED")]
    Served {},
    /// Well-formed frame with a `type` this server does not know.
    #[serde(skip)]
    Unrecognized(String),
}

impl ClientMessage {
    pub fn kind(&self) -> &str {
        match self {
            ClientMessage::Report { .. } => "REPORT",
            ClientMessage::Request { .. } => "REQUEST",
            ClientMessage::Conn { .. } => "CONN",
            ClientMessage::Response { .. } => "RESPONSE",
            ClientMessage::Invalid { .. } => "INVALID",
            ClientMessage::Served {} => "SERVED",
            ClientMessage::Unrecognized(kind) => kind,
        }
    }
}

/// Server to client frames.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "RESOURCE")]
    Resource(ResourceView),
    #[serde(rename = "RESPONSE")]
    Response { data: Value },
    /// Ask the client to contribute `count` fresh offers.
    #[serde(rename = "REPLENISH")]
    Replenish { count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Decode one client text frame.
///
/// Unknown `type` values decode to [`ClientMessage::Unrecognized`]; anything
/// else that does not fit the protocol is a [`FrameError`].
pub fn decode_client_frame(text: &str) -> Result<ClientMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::InvalidJson(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Ok(ClientMessage::Unrecognized(kind));
    }
    serde_json::from_value(value).map_err(|err| FrameError::Malformed {
        kind,
        reason: err.to_string(),
    })
}

//! Typed messages exchanged over the framed connection.
//!
//! Every frame payload is a JSON object. Server messages carry a `type` tag
//! and are modelled by [`ServerMessage`]; client messages are either a ping
//! or a [`PlaceRequest`].

use crate::{Error, PlaceRequest, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The exact payload a client sends to acknowledge a server message.
pub const ACK: &[u8] = b"ack";

/// Progress report for one chunk of a place request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkProgress {
    /// Zero-based position of the chunk in the request.
    pub num: usize,
    pub filename: String,
    /// The request's `place` object, echoed back unchanged.
    pub place: Value,
}

/// Everything the server can send to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The request was queued.
    Connected,
    /// The upstream has no free slot; the job sleeps for `wait` seconds.
    Status { wait: u64 },
    /// A chunk is about to be fetched from the upstream.
    RunQuery(ChunkProgress),
    /// A chunk is available in the cache.
    Chunk(ChunkProgress),
    /// The request failed. No `done` follows.
    Error { error: String },
    /// Every chunk of the request is available.
    Done,
    /// Reply to a ping.
    Pong,
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Whether the client must answer this message with [`ACK`] before the
    /// next one is sent.
    ///
    /// `pong` and `done` end the conversation. The one `error` that also ends
    /// it, the reply to an undecodable request, is sent by the server without
    /// waiting and is the caller's responsibility to distinguish.
    pub const fn requires_ack(&self) -> bool {
        !matches!(self, Self::Pong | Self::Done)
    }

    /// Whether nothing further follows this message on the connection.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Pong | Self::Done)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Everything a client can send as the opening message of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping,
    Place(PlaceRequest),
}

impl ClientMessage {
    /// Decodes the first frame of a connection.
    ///
    /// Returns [`Error::Json`] when the payload is not JSON at all, and
    /// [`Error::InvalidRequest`] when it is JSON but neither a ping nor a
    /// well-formed place request.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;

        if value.get("type").and_then(Value::as_str) == Some("ping") {
            return Ok(Self::Ping);
        }

        let request =
            PlaceRequest::deserialize(value).map_err(|e| Error::InvalidRequest {
                reason: e.to_string(),
            })?;
        if !request.place.is_object() {
            return Err(Error::InvalidRequest {
                reason: "`place` must be an object".to_string(),
            });
        }
        Ok(Self::Place(request))
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let bytes = match self {
            Self::Ping => serde_json::to_vec(&serde_json::json!({"type": "ping"}))?,
            Self::Place(request) => serde_json::to_vec(request)?,
        };
        Ok(Bytes::from(bytes))
    }
}

//! Wire protocol for the cove gateway.
//!
//! Frames carry JSON-serialised [`Request`] and [`Response`] documents.
//! Text frames are plain JSON. Binary frames are prefixed with a single
//! flag byte describing the payload encoding, so a reader never has to
//! guess whether the remainder is deflated.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Frames at or above this many serialised bytes are eligible for
/// per-frame compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Deflate level used for outbound frames. Kept low: frames are small
/// and latency matters more than ratio.
pub const COMPRESSION_LEVEL: u32 = 1;

const FLAG_PLAIN: u8 = 0;
const FLAG_DEFLATE: u8 = 1;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("deflate failure: {0}")]
    Deflate(#[from] std::io::Error),
    #[error("empty binary frame")]
    EmptyBinaryFrame,
    #[error("unknown binary frame flag {0:#04x}")]
    UnknownFlag(u8),
}

/// Client-assigned request identifier, echoed back on the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One inbound operation. `params` is opaque to the gateway and handed
/// to the workspace pipeline untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Machine-readable error classes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    UnknownMethod,
    Upgrading,
    ShuttingDown,
    PipelineError,
    TransportError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
}

/// Reply or server-initiated status document. Responses without an `id`
/// are broadcasts or status pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn result(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Status push announcing scheduled maintenance.
    pub fn maintenance(remaining_minutes: u32) -> Self {
        Self::result(
            None,
            json!({ "state": "maintenance", "remaining": remaining_minutes }),
        )
    }

    /// Answer to a request that raced a workspace upgrade.
    pub fn upgrading(id: Option<RequestId>) -> Self {
        Self::result(id, json!({ "state": "upgrading" }))
    }

    /// Handed to a non-privileged client that tried to attach while its
    /// workspace was upgrading.
    pub fn upgrade_required(info: Value) -> Self {
        Self::result(None, json!({ "upgrade": true, "upgradeInfo": info }))
    }
}

/// A transport frame, independent of the carrying socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialise a response into a frame, honoring the session's binary and
/// compression flags. Compression only applies to binary frames at or
/// above [`COMPRESSION_THRESHOLD`].
pub fn encode_response(
    response: &Response,
    binary: bool,
    compress: bool,
) -> Result<WireFrame, ProtoError> {
    if !binary {
        return Ok(WireFrame::Text(serde_json::to_string(response)?));
    }

    let payload = serde_json::to_vec(response)?;
    if compress && payload.len() >= COMPRESSION_THRESHOLD {
        let mut out = vec![FLAG_DEFLATE];
        let mut encoder = DeflateEncoder::new(&mut out, Compression::new(COMPRESSION_LEVEL));
        encoder.write_all(&payload)?;
        encoder.finish()?;
        Ok(WireFrame::Binary(out))
    } else {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(FLAG_PLAIN);
        out.extend_from_slice(&payload);
        Ok(WireFrame::Binary(out))
    }
}

pub fn decode_request(frame: &WireFrame) -> Result<Request, ProtoError> {
    Ok(serde_json::from_slice(&frame_payload(frame)?)?)
}

/// Used by clients and tests; the gateway itself only decodes requests.
pub fn decode_response(frame: &WireFrame) -> Result<Response, ProtoError> {
    Ok(serde_json::from_slice(&frame_payload(frame)?)?)
}

fn frame_payload(frame: &WireFrame) -> Result<Vec<u8>, ProtoError> {
    match frame {
        WireFrame::Text(text) => Ok(text.as_bytes().to_vec()),
        WireFrame::Binary(bytes) => {
            let (&flag, rest) = bytes.split_first().ok_or(ProtoError::EmptyBinaryFrame)?;
            match flag {
                FLAG_PLAIN => Ok(rest.to_vec()),
                FLAG_DEFLATE => {
                    let mut decoder = DeflateDecoder::new(rest);
                    let mut payload = Vec::new();
                    decoder.read_to_end(&mut payload)?;
                    Ok(payload)
                }
                other => Err(ProtoError::UnknownFlag(other)),
            }
        }
    }
}

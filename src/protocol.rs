//! Wire format spoken across the isolation boundary.
//!
//! Every frame is one line of JSON. Requests flow from the untrusted side to the
//! host, responses flow back, and the two are paired by `correlationId`:
//!
//! ```text
//! {"type":"request","correlationId":7,"name":"get-platform","args":{}}
//! {"type":"response","correlationId":7,"ok":true,"value":{"platform":"linux",...}}
//! {"type":"response","correlationId":8,"ok":false,"errorKind":"NotFound","message":"..."}
//! ```

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::{BridgeError, BridgeResult};
use crate::registry::HandlerError;

/// Frames longer than this are rejected by both ends.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub type CorrelationId = u64;

/// Failure categories that can travel inside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    InvalidArguments,
    HandlerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub correlation_id: CorrelationId,
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

/// Error half of a response outcome, as seen on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Outcome = Result<Value, RemoteError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

/// Flat `{ok, value | errorKind + message}` shape used for serialization.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    correlation_id: CorrelationId,
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        match response.outcome {
            Ok(value) => WireResponse {
                correlation_id: response.correlation_id,
                ok: true,
                value: Some(value),
                error_kind: None,
                message: None,
            },
            Err(err) => WireResponse {
                correlation_id: response.correlation_id,
                ok: false,
                value: None,
                error_kind: Some(err.kind),
                message: Some(err.message),
            },
        }
    }
}

impl TryFrom<WireResponse> for Response {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        let outcome = if wire.ok {
            Ok(wire.value.unwrap_or(Value::Null))
        } else {
            let kind = wire
                .error_kind
                .ok_or_else(|| "failed response is missing errorKind".to_string())?;
            Err(RemoteError {
                kind,
                message: wire.message.unwrap_or_default(),
            })
        };
        Ok(Response {
            correlation_id: wire.correlation_id,
            outcome,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Response(Response),
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Response {
    /// Build the response for a dispatch result on the host side.
    pub fn from_result(correlation_id: CorrelationId, result: BridgeResult<Value>) -> Self {
        let outcome = result.map_err(|err| RemoteError {
            kind: ErrorKind::from(&err),
            message: err.to_string(),
        });
        Response {
            correlation_id,
            outcome,
        }
    }
}

impl From<&BridgeError> for ErrorKind {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            _ => ErrorKind::HandlerError,
        }
    }
}

impl RemoteError {
    /// Rebuild the local error for a failed call to `capability`.
    pub fn into_bridge_error(self, capability: &str) -> BridgeError {
        match self.kind {
            ErrorKind::NotFound => BridgeError::NotFound(capability.to_string()),
            ErrorKind::InvalidArguments => {
                BridgeError::invalid_arguments(capability, self.message)
            }
            ErrorKind::HandlerError => {
                BridgeError::handler(capability, HandlerError::Remote(self.message))
            }
        }
    }
}

pub fn encode(message: &Message) -> BridgeResult<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode(line: &str) -> BridgeResult<Message> {
    serde_json::from_str(line)
        .map_err(|e| BridgeError::Protocol(format!("Invalid frame: {}", e)))
}

/// Best-effort extraction of a correlation id from a frame that failed to decode,
/// so the host can still answer it.
pub fn correlation_hint(line: &str) -> Option<CorrelationId> {
    let raw: Value = serde_json::from_str(line).ok()?;
    if raw.get("type").and_then(|t| t.as_str()) != Some("request") {
        return None;
    }
    raw.get("correlationId").and_then(|v| v.as_u64())
}

/// One decoded line, or the marker left behind by a line that ran past
/// [`MAX_FRAME_LEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Oversized,
}

/// Newline-delimited frames capped at [`MAX_FRAME_LEN`].
///
/// An overlong line is skipped through to its newline and surfaces as
/// [`Frame::Oversized`] instead of a stream error, so one bad frame never ends
/// the stream for the frames around it.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
        }
    }

    fn frame(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Frame>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(e) => Err(e),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::frame(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::frame(self.lines.decode_eof(buf))
    }
}

impl Encoder<String> for FrameCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), LinesCodecError> {
        self.lines.encode(line, buf)
    }
}

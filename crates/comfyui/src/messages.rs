//! Realtime channel frame codec.
//!
//! ComfyUI pushes two kinds of frames over the WebSocket:
//!
//! * **Text** frames carrying JSON envelopes `{"type": "<kind>", "data": {...}}`.
//! * **Binary** frames starting with a big-endian `u32` type tag. Type `1`
//!   is a preview image: a second `u32` selects the image format and the
//!   image bytes follow at offset 8.
//!
//! Both are decoded into a single [`InboundMessage`] enum. Text kinds that
//! are not built in are only accepted when the caller registered them.

use std::collections::HashSet;
use std::io::Cursor;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Binary frame type tag for preview images.
pub const BINARY_PREVIEW_IMAGE: u32 = 1;

/// Preview format sub-tag for JPEG images (also the fallback).
pub const PREVIEW_FORMAT_JPEG: u32 = 1;

/// Preview format sub-tag for PNG images.
pub const PREVIEW_FORMAT_PNG: u32 = 2;

/// Size of the `u32` type tag at the start of every binary frame.
const BINARY_TAG_LEN: usize = 4;

/// Offset of the image payload inside a preview frame.
const PREVIEW_HEADER_LEN: usize = 8;

/// Every message the realtime channel can deliver.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Binary preview frame.
    Preview(PreviewImage),

    /// Server status broadcast (queue depth, assigned session id).
    Status(StatusData),

    /// Step-level progress from a long-running node (e.g. KSampler).
    Progress(ProgressData),

    /// A node started executing, or scheduling finished when `node` is `None`.
    Executing(ExecutingData),

    /// A node finished and produced output.
    Executed(ExecutedData),

    /// A prompt started executing.
    ExecutionStart(ExecutionStartData),

    /// A node raised an exception.
    ExecutionError(ErrorData),

    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(ExecutionCachedData),

    /// The run executed but its result was not recorded downstream.
    ExecutionUntracked(ExecutionUntrackedData),

    /// The run executed and its result was recorded downstream.
    ExecutionFinished(ExecutionFinishedData),

    /// The run was interrupted server-side.
    ExecutionInterrupted(InterruptedData),

    /// A caller-registered message type, forwarded verbatim.
    Custom { kind: String, data: Value },
}

impl InboundMessage {
    /// Wire name of the message kind, e.g. `"execution_start"`.
    pub fn kind(&self) -> &str {
        match self {
            Self::Preview(_) => "b_preview",
            Self::Status(_) => "status",
            Self::Progress(_) => "progress",
            Self::Executing(_) => "executing",
            Self::Executed(_) => "executed",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionError(_) => "execution_error",
            Self::ExecutionCached(_) => "execution_cached",
            Self::ExecutionUntracked(_) => "execution_untracked",
            Self::ExecutionFinished(_) => "execution_finished",
            Self::ExecutionInterrupted(_) => "execution_interrupted",
            Self::Custom { kind, .. } => kind,
        }
    }

    /// The prompt this message refers to, if it carries one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executing(d) => Some(&d.prompt_id),
            Self::Executed(d) => Some(&d.prompt_id),
            Self::ExecutionStart(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::ExecutionUntracked(d) => Some(&d.prompt_id),
            Self::ExecutionFinished(d) => Some(&d.prompt_id),
            Self::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Self::Preview(_) | Self::Status(_) | Self::Custom { .. } => None,
        }
    }
}

/// A decoded preview image.
#[derive(Debug, Clone)]
pub struct PreviewImage {
    /// `image/jpeg` or `image/png`.
    pub mime_type: &'static str,
    /// Raw encoded image bytes.
    pub bytes: Vec<u8>,
}

impl PreviewImage {
    /// Pixel dimensions read from the image header, if it can be parsed.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        image::ImageReader::new(Cursor::new(self.bytes.as_slice()))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    }
}

/// Payload for `status` messages.
///
/// `status` is `None` for the synthetic null status emitted on disconnect
/// or when a fallback poll fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub status: Option<QueueStatus>,
    /// Server-assigned session id, sent on the first status after connecting.
    #[serde(default)]
    pub sid: Option<String>,
}

impl StatusData {
    /// The null status used to signal "no information".
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Wrap a queue status obtained outside the realtime channel.
    pub fn from_queue(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            sid: None,
        }
    }

    /// Remaining queue depth, when known.
    pub fn queue_remaining(&self) -> Option<i32> {
        self.status.as_ref().map(|s| s.exec_info.queue_remaining)
    }
}

/// Current queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: f64,
    /// Total number of steps.
    pub max: f64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// The node reporting progress.
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, scheduling for the prompt is done. This does not
/// say whether the run succeeded.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    #[serde(default)]
    pub output: Value,
    pub prompt_id: String,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
    #[serde(default)]
    pub traceback: Value,
    #[serde(default)]
    pub executed: Value,
    #[serde(default)]
    pub current_inputs: Value,
    #[serde(default)]
    pub current_outputs: Value,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `execution_untracked` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionUntrackedData {
    pub prompt_id: String,
    #[serde(default, alias = "message")]
    pub execution_message: Value,
}

/// Payload for `execution_finished` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFinishedData {
    pub prompt_id: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub executed: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InterruptedData {
    /// Every field except `prompt_id`, as reported to consumers.
    pub fn detail(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Value::Object(map) = &mut value {
            map.remove("prompt_id");
        }
        value
    }
}

/// Errors produced while decoding a single frame.
///
/// None of these affect the channel itself; the frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The text frame is not a JSON envelope.
    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope's `data` does not match the shape of its `type`.
    #[error("Invalid payload for message type {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The `type` is neither built in nor registered.
    #[error("Unknown message type {0}")]
    UnknownType(String),

    /// The binary type tag is not recognised.
    #[error("Unknown binary websocket message of type {0}")]
    UnknownBinaryType(u32),

    /// The binary frame is shorter than its header.
    #[error("Binary frame too short: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },
}

/// Raw `{type, data}` envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode a text frame.
///
/// `registered` lists extra message types the caller wants forwarded as
/// [`InboundMessage::Custom`].
pub fn decode_text(text: &str, registered: &HashSet<String>) -> Result<InboundMessage, FrameError> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let msg = match kind.as_str() {
        "status" => InboundMessage::Status(payload(&kind, data)?),
        "progress" => InboundMessage::Progress(payload(&kind, data)?),
        "executing" => InboundMessage::Executing(payload(&kind, data)?),
        "executed" => InboundMessage::Executed(payload(&kind, data)?),
        "execution_start" => InboundMessage::ExecutionStart(payload(&kind, data)?),
        "execution_error" => InboundMessage::ExecutionError(payload(&kind, data)?),
        "execution_cached" => InboundMessage::ExecutionCached(payload(&kind, data)?),
        "execution_untracked" => InboundMessage::ExecutionUntracked(payload(&kind, data)?),
        "execution_finished" => InboundMessage::ExecutionFinished(payload(&kind, data)?),
        "execution_interrupted" => InboundMessage::ExecutionInterrupted(payload(&kind, data)?),
        _ if registered.contains(&kind) => InboundMessage::Custom { kind, data },
        _ => return Err(FrameError::UnknownType(kind)),
    };

    Ok(msg)
}

/// Decode a binary frame.
pub fn decode_binary(frame: &[u8]) -> Result<InboundMessage, FrameError> {
    let event_type = read_u32_be(frame, 0)?;

    match event_type {
        BINARY_PREVIEW_IMAGE => {
            let format = read_u32_be(frame, BINARY_TAG_LEN)?;
            let mime_type = match format {
                PREVIEW_FORMAT_PNG => "image/png",
                _ => "image/jpeg",
            };
            Ok(InboundMessage::Preview(PreviewImage {
                mime_type,
                bytes: frame[PREVIEW_HEADER_LEN..].to_vec(),
            }))
        }
        other => Err(FrameError::UnknownBinaryType(other)),
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

fn read_u32_be(frame: &[u8], offset: usize) -> Result<u32, FrameError> {
    let end = offset + 4;
    let bytes: [u8; 4] = frame
        .get(offset..end)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(FrameError::Truncated {
            len: frame.len(),
            needed: end,
        })?;
    Ok(u32::from_be_bytes(bytes))
}

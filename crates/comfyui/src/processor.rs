//! WebSocket frame processing loop.
//!
//! Reads raw frames from a live connection, decodes them into
//! [`InboundMessage`]s and broadcasts each one as a
//! [`TransportEvent::Message`]. Frames that fail to decode are logged and
//! dropped; they never end the connection.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClientError, WsStream};
use crate::events::TransportEvent;
use crate::messages::{decode_binary, decode_text, InboundMessage, PreviewImage, StatusData};
use crate::session::SessionIdentity;

/// Process frames until the socket closes, errors, or `cancel` fires.
///
/// Returns `Err` only for a receive error on the socket; a clean close or
/// cancellation is `Ok`.
pub async fn process_frames(
    ws_stream: &mut WsStream,
    identity: &SessionIdentity,
    registered: &RwLock<HashSet<String>>,
    event_tx: &broadcast::Sender<TransportEvent>,
    cancel: &CancellationToken,
) -> Result<(), ComfyUIClientError> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_stream.close(None).await;
                return Ok(());
            }
            next = ws_stream.next() => next,
        };

        let Some(msg_result) = next else {
            return Ok(());
        };

        match msg_result {
            Ok(Message::Text(text)) => {
                let decoded = {
                    let registered = registered.read().unwrap_or_else(PoisonError::into_inner);
                    decode_text(&text, &registered)
                };
                match decoded {
                    Ok(msg) => dispatch(msg, identity, event_tx),
                    Err(e) => {
                        tracing::warn!(error = %e, raw_message = %text, "Dropping text frame");
                    }
                }
            }
            Ok(Message::Binary(data)) => match decode_binary(&data) {
                Ok(msg) => dispatch(msg, identity, event_tx),
                Err(e) => {
                    tracing::warn!(error = %e, len = data.len(), "Dropping binary frame");
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return Ok(());
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                return Err(ComfyUIClientError::Protocol(e.to_string()));
            }
        }
    }
}

/// Apply side effects of a decoded message, then broadcast it.
fn dispatch(
    msg: InboundMessage,
    identity: &SessionIdentity,
    event_tx: &broadcast::Sender<TransportEvent>,
) {
    match msg {
        InboundMessage::Status(ref data) => adopt_sid(data, identity),
        InboundMessage::Preview(ref preview) => {
            log_preview(preview);
        }
        ref other => {
            tracing::debug!(kind = other.kind(), prompt_id = ?other.prompt_id(), "Frame");
        }
    }
    let _ = event_tx.send(TransportEvent::Message(msg));
}

fn adopt_sid(data: &StatusData, identity: &SessionIdentity) {
    tracing::debug!(queue_remaining = ?data.queue_remaining(), "ComfyUI queue status");
    if let Some(ref sid) = data.sid {
        if let Err(e) = identity.adopt(sid) {
            tracing::error!(error = %e, "Failed to persist client identity");
        }
    }
}

/// Returns whether the image header was inspected.
fn log_preview(preview: &PreviewImage) -> bool {
    // Header sniff only when the line will be recorded.
    if !tracing::enabled!(tracing::Level::TRACE) {
        return false;
    }
    match preview.dimensions() {
        Some((width, height)) => tracing::trace!(
            mime_type = preview.mime_type,
            width,
            height,
            "Preview image",
        ),
        None => tracing::trace!(
            mime_type = preview.mime_type,
            len = preview.bytes.len(),
            "Preview image with unreadable header",
        ),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_header_untouched_without_trace() {
        let preview = PreviewImage {
            mime_type: "image/png",
            bytes: vec![0x89, b'P', b'N', b'G'],
        };
        assert!(!log_preview(&preview));
    }
}

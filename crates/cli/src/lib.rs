//! Helpers for the `promptwatch` command-line client.

use std::path::Path;

use anyhow::Context;
use promptwatch_comfyui::events::{LifecycleEvent, TransportEvent};
use promptwatch_comfyui::messages::InboundMessage;
use serde_json::{json, Value};

/// A workflow file split into what the backend executes and what is
/// attached as metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFile {
    /// API-format graph keyed by node id.
    pub output: Value,
    /// Editor workflow stored alongside the run, `null` when absent.
    pub workflow: Value,
}

impl WorkflowFile {
    /// Accepts either a bare API-format graph or `{"prompt": .., "workflow": ..}`.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let Value::Object(mut map) = value else {
            anyhow::bail!("workflow file must contain a JSON object");
        };

        if let Some(Value::Object(prompt)) = map.remove("prompt") {
            let workflow = map.remove("workflow").unwrap_or(Value::Null);
            return Ok(Self {
                output: Value::Object(prompt),
                workflow,
            });
        }

        if map.is_empty() {
            anyhow::bail!("workflow file contains no nodes");
        }
        Ok(Self {
            output: Value::Object(map),
            workflow: Value::Null,
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value: Value =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_value(value)
    }
}

/// One JSON line per lifecycle event.
pub fn lifecycle_line(event: &LifecycleEvent) -> anyhow::Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// One JSON line per transport event worth showing in watch mode.
///
/// Previews are summarised rather than dumped.
pub fn transport_line(event: &TransportEvent) -> Value {
    match event {
        TransportEvent::Connection(connection) => json!({ "connection": connection }),
        TransportEvent::Message(InboundMessage::Status(status)) => json!({
            "type": "status",
            "queue_remaining": status.queue_remaining(),
        }),
        TransportEvent::Message(InboundMessage::Preview(preview)) => json!({
            "type": "b_preview",
            "mime_type": preview.mime_type,
            "bytes": preview.bytes.len(),
        }),
        TransportEvent::Message(msg) => json!({
            "type": msg.kind(),
            "prompt_id": msg.prompt_id(),
        }),
    }
}

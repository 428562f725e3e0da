//! Events emitted to consumers.
//!
//! [`TransportEvent`]s describe the realtime channel itself and carry every
//! decoded message. [`LifecycleEvent`]s are the five high-level signals the
//! execution tracker derives for the active run.

use promptwatch_core::execution::ExecuteErrorCode;
use promptwatch_core::lifecycle_events::{
    EVENT_EXECUTE_COMPLETE, EVENT_EXECUTE_ERROR, EVENT_EXECUTE_PROGRESS, EVENT_EXECUTE_START,
    EVENT_QUEUE_CHANGED,
};
use promptwatch_core::types::PromptId;
use serde::Serialize;

use crate::messages::InboundMessage;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The realtime channel opened for the first time.
    Opened,
    /// The realtime channel opened again after a drop.
    Reconnected,
    /// A previously open channel closed.
    Closed,
    /// A reconnect has been scheduled.
    Reconnecting,
    /// The channel never opened; status is polled from now on.
    PollingFallback,
}

/// Everything the transport manager broadcasts.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection(ConnectionEvent),
    /// A decoded frame, a polled status, or a synthetic null status.
    Message(InboundMessage),
}

/// High-level lifecycle signal for the active run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// Queue position of the run (`current` of `total`).
    #[serde(rename = "queueChanged", rename_all = "camelCase")]
    QueueChanged {
        prompt_id: PromptId,
        current: usize,
        total: usize,
    },

    #[serde(rename = "executeStart", rename_all = "camelCase")]
    ExecuteStart { prompt_id: PromptId },

    /// Aggregate progress percentage (0-100, two decimals).
    #[serde(rename = "executeProgress", rename_all = "camelCase")]
    ExecuteProgress { prompt_id: PromptId, progress: f64 },

    #[serde(rename = "executeComplete", rename_all = "camelCase")]
    ExecuteComplete { prompt_id: PromptId },

    /// Terminal failure. `error` carries the backend's detail payload.
    #[serde(rename = "executeError", rename_all = "camelCase")]
    ExecuteError {
        prompt_id: PromptId,
        error_code: ExecuteErrorCode,
        error: serde_json::Value,
    },
}

impl LifecycleEvent {
    /// Event name as bound by UI consumers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueChanged { .. } => EVENT_QUEUE_CHANGED,
            Self::ExecuteStart { .. } => EVENT_EXECUTE_START,
            Self::ExecuteProgress { .. } => EVENT_EXECUTE_PROGRESS,
            Self::ExecuteComplete { .. } => EVENT_EXECUTE_COMPLETE,
            Self::ExecuteError { .. } => EVENT_EXECUTE_ERROR,
        }
    }

    /// The run this event belongs to.
    pub fn prompt_id(&self) -> &str {
        match self {
            Self::QueueChanged { prompt_id, .. }
            | Self::ExecuteStart { prompt_id }
            | Self::ExecuteProgress { prompt_id, .. }
            | Self::ExecuteComplete { prompt_id }
            | Self::ExecuteError { prompt_id, .. } => prompt_id,
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecuteComplete { .. } | Self::ExecuteError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_tag_matches_event_name() {
        let events = [
            LifecycleEvent::QueueChanged {
                prompt_id: "p".into(),
                current: 1,
                total: 3,
            },
            LifecycleEvent::ExecuteStart {
                prompt_id: "p".into(),
            },
            LifecycleEvent::ExecuteProgress {
                prompt_id: "p".into(),
                progress: 12.5,
            },
            LifecycleEvent::ExecuteComplete {
                prompt_id: "p".into(),
            },
            LifecycleEvent::ExecuteError {
                prompt_id: "p".into(),
                error_code: ExecuteErrorCode::ServerTimeout,
                error: serde_json::Value::Null,
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.name());
            assert_eq!(json["promptId"], "p");
        }
    }

    #[test]
    fn error_event_uses_camel_case_fields() {
        let event = LifecycleEvent::ExecuteError {
            prompt_id: "p".into(),
            error_code: ExecuteErrorCode::ExecutionFailed,
            error: serde_json::json!({"node_id": "2"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["errorCode"], "ExecutionFailed");
        assert_eq!(json["error"]["node_id"], "2");
        assert!(event.is_terminal());
    }

    #[test]
    fn queue_changed_fields() {
        let event = LifecycleEvent::QueueChanged {
            prompt_id: "p".into(),
            current: 2,
            total: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["current"], 2);
        assert_eq!(json["total"], 5);
        assert!(!event.is_terminal());
    }
}

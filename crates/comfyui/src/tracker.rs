//! Execution tracker for the single active run.
//!
//! [`ExecutionTracker`] owns at most one [`ExecutionSession`] and turns the
//! decoded message stream into ordered [`LifecycleEvent`]s. Messages for any
//! other prompt, or arriving while no run is active, are ignored.
//!
//! Queue position is not pushed by the backend. A `status` message instead
//! triggers a queue snapshot fetch, which resolves asynchronously. Handling
//! is therefore split: [`ExecutionTracker::queue_probe`] captures the
//! tracker generation before the fetch and
//! [`ExecutionTracker::apply_queue_snapshot`] discards the result if any
//! execution event moved the generation in the meantime.

use std::collections::HashMap;

use async_trait::async_trait;
use promptwatch_core::error::CoreError;
use promptwatch_core::execution::{ExecuteErrorCode, ExecuteStatus, NodeStatus};
use promptwatch_core::progress::{aggregate_progress, step_fraction, PROGRESS_COMPLETE};
use promptwatch_core::types::{NodeId, PromptId};

use crate::api::{ComfyUIApiError, QueueSnapshot};
use crate::events::LifecycleEvent;
use crate::messages::InboundMessage;

/// Source of queue snapshots for Status handling.
#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot, ComfyUIApiError>;
}

/// State of the run being tracked.
#[derive(Debug, Clone)]
pub struct ExecutionSession {
    prompt_id: PromptId,
    /// Fixed at creation, in submission order.
    node_ids: Vec<NodeId>,
    node_status: HashMap<NodeId, NodeStatus>,
    status: ExecuteStatus,
}

impl ExecutionSession {
    fn new(prompt_id: PromptId, node_ids: Vec<NodeId>) -> Self {
        let node_status = node_ids
            .iter()
            .map(|id| (id.clone(), NodeStatus::Pending))
            .collect();
        Self {
            prompt_id,
            node_ids,
            node_status,
            status: ExecuteStatus::Unknown,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    pub fn status(&self) -> ExecuteStatus {
        self.status
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_status.get(node_id).copied()
    }

    /// Set a node's status. Returns `false` for ids outside the run.
    fn mark(&mut self, node_id: &str, status: NodeStatus) -> bool {
        match self.node_status.get_mut(node_id) {
            Some(slot) => {
                *slot = status;
                true
            }
            None => {
                tracing::debug!(
                    prompt_id = %self.prompt_id,
                    node = %node_id,
                    "Ignoring status for node outside the run",
                );
                false
            }
        }
    }

    fn progress(&self, fractions: &[f64]) -> f64 {
        aggregate_progress(self.node_status.values().copied(), fractions)
    }

    fn progress_event(&self, progress: f64) -> LifecycleEvent {
        LifecycleEvent::ExecuteProgress {
            prompt_id: self.prompt_id.clone(),
            progress,
        }
    }

    fn error_event(&self, error_code: ExecuteErrorCode, error: serde_json::Value) -> LifecycleEvent {
        LifecycleEvent::ExecuteError {
            prompt_id: self.prompt_id.clone(),
            error_code,
            error,
        }
    }
}

/// Ticket captured before a queue snapshot fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProbe {
    pub prompt_id: PromptId,
    generation: u64,
}

/// Converts inbound messages into lifecycle events for one run at a time.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    session: Option<ExecutionSession>,
    /// Overall status of the last run once its session has been cleared.
    last_status: ExecuteStatus,
    /// Bumped on every session mutation driven by execution events.
    generation: u64,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a submission accepted by the backend.
    ///
    /// Fails without touching any state when a run is already active, or
    /// when the prompt id or node list is empty. Duplicate node ids are
    /// collapsed, keeping the first occurrence.
    pub fn begin<I, S>(&mut self, prompt_id: impl Into<String>, node_ids: I) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(ref active) = self.session {
            return Err(CoreError::SessionActive {
                prompt_id: active.prompt_id.clone(),
            });
        }

        let prompt_id = prompt_id.into();
        if prompt_id.is_empty() {
            return Err(CoreError::InvalidSubmission("prompt id is required".into()));
        }

        let mut ordered: Vec<NodeId> = Vec::new();
        for id in node_ids {
            let id = id.into();
            if !ordered.contains(&id) {
                ordered.push(id);
            }
        }
        if ordered.is_empty() {
            return Err(CoreError::InvalidSubmission(
                "at least one node id is required".into(),
            ));
        }

        tracing::info!(prompt_id = %prompt_id, nodes = ordered.len(), "Tracking run");
        self.session = Some(ExecutionSession::new(prompt_id, ordered));
        self.last_status = ExecuteStatus::Unknown;
        self.generation += 1;
        Ok(())
    }

    /// Drop the active run, if any, without emitting anything.
    pub fn clear(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(prompt_id = %session.prompt_id, "Cleared run");
        }
        self.last_status = ExecuteStatus::Unknown;
        self.generation += 1;
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&ExecutionSession> {
        self.session.as_ref()
    }

    pub fn active_prompt_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.prompt_id.as_str())
    }

    /// Overall status of the active run, or how the last run ended.
    pub fn overall_status(&self) -> ExecuteStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(self.last_status)
    }

    // ---- status / queue position ----

    /// Capture what a queue snapshot fetch needs, if one is worth issuing.
    ///
    /// Returns `None` when no run is active or the run is already executing.
    pub fn queue_probe(&self) -> Option<QueueProbe> {
        let session = self.session.as_ref()?;
        if !session.status.accepts_queue_updates() {
            return None;
        }
        Some(QueueProbe {
            prompt_id: session.prompt_id.clone(),
            generation: self.generation,
        })
    }

    /// Apply a snapshot fetched for `probe`.
    ///
    /// A snapshot that resolves after the run moved on is discarded. Index 0
    /// while already pending is shifted to 1: the run heads the running queue
    /// but `execution_start` has not arrived yet.
    pub fn apply_queue_snapshot(
        &mut self,
        probe: &QueueProbe,
        snapshot: &QueueSnapshot,
    ) -> Option<LifecycleEvent> {
        if probe.generation != self.generation {
            tracing::debug!(prompt_id = %probe.prompt_id, "Discarding stale queue snapshot");
            return None;
        }
        let session = self.session.as_mut()?;
        if session.prompt_id != probe.prompt_id || !session.status.accepts_queue_updates() {
            return None;
        }

        let mut current = snapshot.position_of(&session.prompt_id)?;
        if current == 0 && session.status == ExecuteStatus::Pending {
            current += 1;
        }
        if current == 0 {
            return None;
        }

        session.status = ExecuteStatus::Pending;
        Some(LifecycleEvent::QueueChanged {
            prompt_id: session.prompt_id.clone(),
            current,
            total: snapshot.total(),
        })
    }

    /// Handle a `status` message end to end against `queue`.
    ///
    /// Fetch failures are logged and produce no event.
    pub async fn on_status<Q: QueueSource + ?Sized>(&mut self, queue: &Q) -> Option<LifecycleEvent> {
        let probe = self.queue_probe()?;
        match queue.queue_snapshot().await {
            Ok(snapshot) => self.apply_queue_snapshot(&probe, &snapshot),
            Err(e) => {
                tracing::warn!(prompt_id = %probe.prompt_id, error = %e, "Failed to fetch queue");
                None
            }
        }
    }

    // ---- execution messages ----

    /// Handle any non-status message for the active run.
    pub fn handle_message(&mut self, msg: &InboundMessage) -> Vec<LifecycleEvent> {
        let Some(prompt_id) = msg.prompt_id() else {
            return Vec::new();
        };
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.prompt_id != prompt_id {
            tracing::trace!(
                active = %session.prompt_id,
                prompt_id = %prompt_id,
                kind = msg.kind(),
                "Ignoring message for another prompt",
            );
            return Vec::new();
        }

        let mut events = Vec::new();
        match msg {
            InboundMessage::Progress(data) => {
                let fraction = step_fraction(data.value, data.max);
                let node_status = if fraction == 1.0 {
                    NodeStatus::Finished
                } else {
                    NodeStatus::Running
                };
                let weighted = data
                    .node
                    .as_deref()
                    .is_some_and(|node| session.mark(node, node_status));
                let progress = if weighted {
                    session.progress(&[fraction])
                } else {
                    session.progress(&[])
                };
                events.push(session.progress_event(progress));
                session.status = ExecuteStatus::Running;
            }
            InboundMessage::Executing(data) => {
                let progress = match data.node.as_deref() {
                    // Scheduling is done; success or failure is signalled separately.
                    None => PROGRESS_COMPLETE,
                    Some(node) => {
                        session.mark(node, NodeStatus::Running);
                        session.progress(&[])
                    }
                };
                events.push(session.progress_event(progress));
                session.status = ExecuteStatus::Running;
            }
            InboundMessage::Executed(data) => {
                session.mark(&data.node, NodeStatus::Finished);
                events.push(session.progress_event(session.progress(&[])));
                session.status = ExecuteStatus::Running;
            }
            InboundMessage::ExecutionStart(_) => {
                events.push(LifecycleEvent::ExecuteStart {
                    prompt_id: session.prompt_id.clone(),
                });
                events.push(session.progress_event(0.0));
                session.status = ExecuteStatus::Running;
            }
            InboundMessage::ExecutionCached(data) => {
                for node in &data.nodes {
                    session.mark(node, NodeStatus::Finished);
                }
                events.push(session.progress_event(session.progress(&[])));
            }
            InboundMessage::ExecutionError(data) => {
                session.mark(&data.node_id, NodeStatus::Error);
                let detail = serde_json::to_value(data).unwrap_or_default();
                events.push(session.error_event(ExecuteErrorCode::ExecutionFailed, detail));
                session.status = ExecuteStatus::Error;
            }
            InboundMessage::ExecutionUntracked(data) => {
                events.push(session.error_event(
                    ExecuteErrorCode::ResultUntracked,
                    data.execution_message.clone(),
                ));
                session.status = ExecuteStatus::Error;
            }
            InboundMessage::ExecutionFinished(_) => {
                events.push(session.progress_event(PROGRESS_COMPLETE));
                events.push(LifecycleEvent::ExecuteComplete {
                    prompt_id: session.prompt_id.clone(),
                });
                session.status = ExecuteStatus::Finished;
            }
            InboundMessage::ExecutionInterrupted(data) => {
                events.push(session.error_event(ExecuteErrorCode::ServerTimeout, data.detail()));
                session.status = ExecuteStatus::Error;
            }
            InboundMessage::Preview(_) | InboundMessage::Status(_) | InboundMessage::Custom { .. } => {}
        }

        let status = session.status;
        self.generation += 1;
        if status.is_terminal() {
            self.finish(status);
        }
        events
    }

    /// Close the active run after its terminal event.
    fn finish(&mut self, status: ExecuteStatus) {
        if let Some(session) = self.session.take() {
            match status {
                ExecuteStatus::Finished => {
                    tracing::info!(prompt_id = %session.prompt_id, "Run completed")
                }
                _ => tracing::warn!(prompt_id = %session.prompt_id, ?status, "Run failed"),
            }
        }
        self.last_status = status;
    }
}

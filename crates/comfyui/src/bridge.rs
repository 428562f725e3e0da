//! Caller-owned client facade.
//!
//! [`ComfyBridge`] wires one session identity, one request channel, one
//! [`TransportManager`] and one [`ExecutionTracker`] together. A single pump
//! task consumes transport events in arrival order and feeds the tracker;
//! queue snapshot fetches triggered by `status` messages run concurrently
//! and are applied through the tracker's generation guard.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use promptwatch_core::error::CoreError;
use promptwatch_core::execution::ExecuteStatus;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, QueueSnapshot, QueuedPrompt};
use crate::config::ClientConfig;
use crate::events::{LifecycleEvent, TransportEvent};
use crate::manager::{TransportManager, EVENT_CHANNEL_CAPACITY};
use crate::messages::InboundMessage;
use crate::tracker::{ExecutionTracker, QueueProbe, QueueSource};

const PUMP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type QueueFetch = BoxFuture<'static, (QueueProbe, Result<QueueSnapshot, ComfyUIApiError>)>;

/// Errors returned by [`ComfyBridge`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Tracker(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),
}

/// One client instance: identity, transport, tracker and event fan-out.
///
/// The pump reads the transport's bounded event channel. If it falls more
/// than `EVENT_CHANNEL_CAPACITY` events behind, the skipped frames are lost
/// and are logged at `warn`. When those included the terminal message of the
/// active run, the tracker stays active and [`ComfyBridge::submit_and_track`]
/// keeps failing with `SessionActive` until [`ComfyBridge::clear`] is called.
pub struct ComfyBridge {
    api: Arc<ComfyUIApi>,
    transport: Arc<TransportManager>,
    tracker: Arc<Mutex<ExecutionTracker>>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ComfyBridge {
    /// Build every component from `config`, start the pump and open the
    /// realtime channel.
    pub async fn start(config: &ClientConfig) -> Arc<Self> {
        let identity = Arc::new(config.identity());
        let api = Arc::new(ComfyUIApi::new(config.api_url.clone(), identity));
        let transport = TransportManager::new(config.ws_url.clone(), Arc::clone(&api), config.reconnect);
        Self::with_transport(api, transport).await
    }

    /// Start a bridge over an existing request channel and transport.
    pub async fn with_transport(api: Arc<ComfyUIApi>, transport: Arc<TransportManager>) -> Arc<Self> {
        let (lifecycle_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tracker = Arc::new(Mutex::new(ExecutionTracker::new()));
        let cancel = CancellationToken::new();

        // Subscribe before opening so the first frames are not missed.
        let transport_rx = transport.subscribe();
        let pump = tokio::spawn(run_pump(
            Arc::clone(&tracker),
            Arc::clone(&api),
            lifecycle_tx.clone(),
            transport_rx,
            cancel.clone(),
        ));

        let bridge = Arc::new(Self {
            api,
            transport,
            tracker,
            lifecycle_tx,
            pump: Mutex::new(Some(pump)),
            cancel,
        });
        bridge.transport.open().await;
        bridge
    }

    /// Subscribe to lifecycle events of tracked runs.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Subscribe to raw transport events.
    pub fn subscribe_transport(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    pub fn api(&self) -> &Arc<ComfyUIApi> {
        &self.api
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    /// Track a run submitted by other means.
    pub async fn begin(&self, prompt_id: &str, node_ids: Vec<String>) -> Result<(), BridgeError> {
        self.tracker.lock().await.begin(prompt_id, node_ids)?;
        Ok(())
    }

    /// Stop tracking the active run without emitting anything.
    pub async fn clear(&self) {
        self.tracker.lock().await.clear();
    }

    pub async fn active_prompt_id(&self) -> Option<String> {
        self.tracker.lock().await.active_prompt_id().map(str::to_string)
    }

    pub async fn overall_status(&self) -> ExecuteStatus {
        self.tracker.lock().await.overall_status()
    }

    /// Validate `output`, start tracking it, then ask the backend to run it.
    ///
    /// Refuses while another run is active. If the execute call fails the
    /// new run is cleared again.
    pub async fn submit_and_track(
        &self,
        output: &Value,
        workflow: Value,
    ) -> Result<QueuedPrompt, BridgeError> {
        if let Some(prompt_id) = self.active_prompt_id().await {
            return Err(CoreError::SessionActive { prompt_id }.into());
        }

        let queued = self.api.queue_prompt(0, output, workflow, None).await?;
        self.begin(&queued.prompt_id, queued.node_ids.clone()).await?;

        if let Err(e) = self.api.execute_prompt(&queued.prompt_id).await {
            tracing::warn!(prompt_id = %queued.prompt_id, error = %e, "Execute request failed");
            self.clear().await;
            return Err(e.into());
        }

        tracing::info!(prompt_id = %queued.prompt_id, "Run submitted");
        Ok(queued)
    }

    /// Stop the pump and the transport.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.transport.shutdown().await;
        if let Some(handle) = self.pump.lock().await.take() {
            let _ = tokio::time::timeout(PUMP_SHUTDOWN_TIMEOUT, handle).await;
        }
    }
}

/// Feed transport events into the tracker until cancelled.
async fn run_pump<Q: QueueSource + 'static>(
    tracker: Arc<Mutex<ExecutionTracker>>,
    queue: Arc<Q>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    mut transport_rx: broadcast::Receiver<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut fetches: FuturesUnordered<QueueFetch> = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            Some((probe, result)) = fetches.next(), if !fetches.is_empty() => {
                let snapshot = match result {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to fetch queue");
                        continue;
                    }
                };
                let event = tracker.lock().await.apply_queue_snapshot(&probe, &snapshot);
                if let Some(event) = event {
                    let _ = lifecycle_tx.send(event);
                }
            }

            recv = transport_rx.recv() => match recv {
                Ok(TransportEvent::Message(InboundMessage::Status(_))) => {
                    let probe = tracker.lock().await.queue_probe();
                    if let Some(probe) = probe {
                        let queue = Arc::clone(&queue);
                        fetches.push(
                            async move {
                                let result = queue.queue_snapshot().await;
                                (probe, result)
                            }
                            .boxed(),
                        );
                    }
                }
                Ok(TransportEvent::Message(msg)) => {
                    let events = tracker.lock().await.handle_message(&msg);
                    for event in events {
                        tracing::debug!(event = event.name(), prompt_id = event.prompt_id(), "Lifecycle event");
                        let _ = lifecycle_tx.send(event);
                    }
                }
                Ok(TransportEvent::Connection(event)) => {
                    tracing::debug!(?event, "Transport connection event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    let active = tracker.lock().await.active_prompt_id().map(str::to_owned);
                    tracing::warn!(skipped, ?active, "Tracker fell behind the transport");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

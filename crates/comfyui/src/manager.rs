//! Realtime transport manager.
//!
//! [`TransportManager`] owns the single realtime channel of a client. It
//! spawns one connection task (connect -> process -> reconnect loop) that
//! also owns the reconnect timer and, when the channel never opened, the
//! polling fallback. Everything the task observes is broadcast as a
//! [`TransportEvent`]; call [`TransportManager::subscribe`] to receive them.
//!
//! Channel and protocol failures never surface to callers. They are logged
//! and turned into connection events.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::client::ComfyUIClient;
use crate::events::{ConnectionEvent, TransportEvent};
use crate::messages::{InboundMessage, StatusData};
use crate::processor::process_frames;
use crate::reconnect::{poll_loop, wait_reconnect_delay, ReconnectConfig};
use crate::session::SessionIdentity;

/// Broadcast channel capacity for transport events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long [`TransportManager::shutdown`] waits for the connection task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable state of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    /// Terminal for the lifetime of the manager.
    PollingFallback,
}

/// Manages the realtime channel to one backend.
///
/// Create with [`TransportManager::new`], then call
/// [`open`](Self::open). The `Arc` can be cloned freely.
pub struct TransportManager {
    client: ComfyUIClient,
    api: Arc<ComfyUIApi>,
    identity: Arc<SessionIdentity>,
    config: ReconnectConfig,
    registered: RwLock<HashSet<String>>,
    event_tx: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TransportManager {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api`    - request channel used by the polling fallback; its
    ///   identity is shared with the socket.
    pub fn new(ws_url: String, api: Arc<ComfyUIApi>, config: ReconnectConfig) -> Arc<Self> {
        let identity = Arc::clone(api.identity());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(Self {
            client: ComfyUIClient::new(ws_url, Arc::clone(&identity)),
            api,
            identity,
            config,
            registered: RwLock::new(HashSet::new()),
            event_tx,
            state_tx,
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to transport events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Session identity shared by the socket and the request channel.
    pub fn identity(&self) -> &Arc<SessionIdentity> {
        &self.identity
    }

    /// Forward text frames of type `kind` as [`InboundMessage::Custom`].
    pub fn register_message_type(&self, kind: impl Into<String>) {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "Registered message type");
        self.registered
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
    }

    /// Start the connection task.
    ///
    /// A no-op while a task is already running, or after shutdown.
    pub async fn open(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            tracing::info!(ws_url = manager.client.ws_url(), "Starting connection task");
            manager.run_connection_loop().await;
            tracing::info!("Connection task exited");
        }));
    }

    /// Stop the connection task, its reconnect timer and any polling.
    ///
    /// Waits up to 5 seconds for the task to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down transport");
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
        self.set_state(ConnectionState::Disconnected);

        tracing::info!("Transport shut down complete");
    }

    // ---- private helpers ----

    /// Core loop: connect -> process frames -> wait -> reconnect.
    ///
    /// Switches to polling for good if the first attempt fails before the
    /// channel ever opened. Runs until the cancellation token fires.
    async fn run_connection_loop(&self) {
        let mut ever_opened = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.set_state(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.client.connect() => result,
            };

            match result {
                Ok(conn) => {
                    self.set_state(ConnectionState::Open);
                    let event = if ever_opened {
                        ConnectionEvent::Reconnected
                    } else {
                        ConnectionEvent::Opened
                    };
                    tracing::info!(attempt, ?event, "Realtime channel open");
                    ever_opened = true;
                    attempt = 0;
                    self.emit(TransportEvent::Connection(event));

                    let mut ws_stream = conn.ws_stream;
                    if let Err(e) = process_frames(
                        &mut ws_stream,
                        &self.identity,
                        &self.registered,
                        &self.event_tx,
                        &self.cancel,
                    )
                    .await
                    {
                        tracing::warn!(error = %e, "Realtime channel failed");
                    }

                    if self.cancel.is_cancelled() {
                        return;
                    }

                    tracing::info!("Connection lost, reconnecting");
                    self.set_state(ConnectionState::Reconnecting);
                    self.emit(TransportEvent::Connection(ConnectionEvent::Closed));
                    self.emit(TransportEvent::Message(InboundMessage::Status(
                        StatusData::disconnected(),
                    )));
                    self.emit(TransportEvent::Connection(ConnectionEvent::Reconnecting));
                }
                Err(e) if !ever_opened => {
                    tracing::warn!(
                        error = %e,
                        poll_ms = self.config.poll_interval.as_millis() as u64,
                        "Realtime channel unavailable, falling back to polling",
                    );
                    self.set_state(ConnectionState::PollingFallback);
                    self.emit(TransportEvent::Connection(ConnectionEvent::PollingFallback));
                    poll_loop(&self.api, &self.event_tx, self.config.poll_interval, &self.cancel)
                        .await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.set_state(ConnectionState::Reconnecting);
                }
            }

            if !wait_reconnect_delay(&self.config, &self.cancel).await {
                return;
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

//! In-process fake backend shared by the integration tests.
//!
//! Serves the HTTP routes the client uses plus a `/ws` realtime endpoint.
//! Responses are configured per `"METHOD /path"` key; every HTTP request is
//! recorded for later assertions. Frames pushed through
//! [`Backend::push`] are forwarded to every open socket.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// A frame the backend sends on the realtime channel.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl Frame {
    /// A `{type, data}` text frame.
    pub fn message(kind: &str, data: Value) -> Self {
        Self::Text(json!({ "type": kind, "data": data }).to_string())
    }
}

/// One HTTP request as received by the backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

pub struct Backend {
    responses: Mutex<HashMap<String, (u16, Value)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    greeting: Mutex<Vec<Frame>>,
    socket_client_ids: Mutex<Vec<Option<String>>>,
    sockets_enabled: AtomicBool,
    push_tx: broadcast::Sender<Frame>,
}

impl Backend {
    pub fn new() -> Arc<Self> {
        let (push_tx, _) = broadcast::channel(64);
        let backend = Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            greeting: Mutex::new(Vec::new()),
            socket_client_ids: Mutex::new(Vec::new()),
            sockets_enabled: AtomicBool::new(true),
            push_tx,
        });
        backend.respond("GET /queue", 200, json!({"queue_running": [], "queue_pending": []}));
        backend.respond("GET /prompt", 200, json!({"exec_info": {"queue_remaining": 0}}));
        backend
    }

    /// Configure the response for `"METHOD /path"`.
    pub fn respond(&self, route: &str, status: u16, body: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(route.to_string(), (status, body));
    }

    /// Frames sent to every socket right after it opens.
    pub fn greet_with(&self, frames: Vec<Frame>) {
        *self.greeting.lock().unwrap() = frames;
    }

    /// Refuse socket upgrades from now on.
    pub fn disable_sockets(&self) {
        self.sockets_enabled.store(false, Ordering::SeqCst);
    }

    /// Send `frame` to every open socket.
    pub fn push(&self, frame: Frame) {
        let _ = self.push_tx.send(frame);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Recorded requests matching `method` and `path`.
    pub fn requests_to(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    /// `clientId` presented by each socket handshake, in order.
    pub fn socket_client_ids(&self) -> Vec<Option<String>> {
        self.socket_client_ids.lock().unwrap().clone()
    }

    /// Bind to an ephemeral port and serve in the background.
    ///
    /// Returns the HTTP base URL, e.g. `http://127.0.0.1:40123`.
    pub async fn spawn(self: &Arc<Self>) -> String {
        let app = Router::new()
            .route("/ws", get(socket))
            .fallback(http)
            .with_state(Arc::clone(self));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

/// Swap the scheme of an HTTP base URL for `ws`.
pub fn ws_url(http_url: &str) -> String {
    http_url.replacen("http://", "ws://", 1)
}

/// Receive from `rx` until `pred` matches, failing after five seconds.
pub async fn recv_until<T: Clone, F: FnMut(&T) -> bool>(
    rx: &mut broadcast::Receiver<T>,
    mut pred: F,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(item) if pred(&item) => return item,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn http(
    State(backend): State<Arc<Backend>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let recorded = RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        query,
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    };
    backend.requests.lock().unwrap().push(recorded);

    let key = format!("{method} {path}");
    let configured = backend.responses.lock().unwrap().get(&key).cloned();
    match configured {
        Some((status, body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "no route"}))).into_response(),
    }
}

async fn socket(
    State(backend): State<Arc<Backend>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !backend.sockets_enabled.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    backend
        .socket_client_ids
        .lock()
        .unwrap()
        .push(query.get("clientId").cloned());

    let greeting = backend.greeting.lock().unwrap().clone();
    let push_rx = backend.push_tx.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, greeting, push_rx))
}

async fn serve_socket(
    mut socket: WebSocket,
    greeting: Vec<Frame>,
    mut push_rx: broadcast::Receiver<Frame>,
) {
    for frame in greeting {
        if send_frame(&mut socket, frame).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            pushed = push_rx.recv() => match pushed {
                Ok(frame) => {
                    if send_frame(&mut socket, frame).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            incoming = socket.recv() => {
                if !matches!(incoming, Some(Ok(_))) {
                    return;
                }
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> Result<(), ()> {
    let msg = match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Close => {
            let _ = socket.send(Message::Close(None)).await;
            return Err(());
        }
    };
    socket.send(msg).await.map_err(|_| ())
}

//! WebSocket client for the realtime channel.
//!
//! [`ComfyUIClient`] holds the socket base URL and the shared
//! [`SessionIdentity`]. Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`]. The URL is rebuilt on every attempt so that an id
//! adopted from an earlier connection is presented on the next one.

use std::sync::Arc;

use tokio_tungstenite::{connect_async, MaybeTlsStream};

use crate::api::CLIENT_ID_PARAM;
use crate::session::SessionIdentity;

/// Query parameter carrying the user token on the socket handshake.
pub const USER_TOKEN_PARAM: &str = "userToken";

/// The raw socket stream type produced by [`ComfyUIClient::connect`].
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the realtime channel of one backend.
pub struct ComfyUIClient {
    ws_url: String,
    identity: Arc<SessionIdentity>,
}

/// A live WebSocket connection.
pub struct ComfyUIConnection {
    /// Client id presented during the handshake, if one was known.
    pub client_id: Option<String>,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// * `ws_url`   - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `identity` - session identity shared with the request channel.
    pub fn new(ws_url: String, identity: Arc<SessionIdentity>) -> Self {
        Self { ws_url, identity }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full socket URL: `<base>/ws` with `clientId` and `userToken` query
    /// parameters when they are known.
    pub fn socket_url(&self) -> Result<reqwest::Url, ComfyUIClientError> {
        let raw = format!("{}/ws", self.ws_url.trim_end_matches('/'));
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| ComfyUIClientError::Connection(format!("Invalid socket URL {raw}: {e}")))?;

        let client_id = self.identity.client_id();
        let user_token = self.identity.credentials().user_token;
        if client_id.is_some() || user_token.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(ref id) = client_id {
                query.append_pair(CLIENT_ID_PARAM, id);
            }
            if let Some(ref token) = user_token {
                query.append_pair(USER_TOKEN_PARAM, token);
            }
        }
        Ok(url)
    }

    /// Connect to the WebSocket endpoint.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = self.socket_url()?;
        let client_id = self.identity.client_id();

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = client_id.as_deref().unwrap_or("<unassigned>"),
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

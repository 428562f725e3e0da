use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::{ReconnectConfig, DEFAULT_POLL_INTERVAL, DEFAULT_RECONNECT_DELAY};
use crate::session::{FileIdentityStore, SessionIdentity};

/// Default backend address for local development.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";

/// Default window key naming the persisted identity slot.
pub const DEFAULT_WINDOW_KEY: &str = "default";

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the backend (default: `http://127.0.0.1:8188`).
    pub api_url: String,
    /// WebSocket base URL; derived from `api_url` unless set.
    pub ws_url: String,
    /// Token sent on every request and on the socket handshake.
    pub user_token: Option<String>,
    /// Reconnect and polling timings.
    pub reconnect: ReconnectConfig,
    /// Directory for persisted identities; `None` keeps the id in memory.
    pub identity_dir: Option<PathBuf>,
    /// Names this client's identity slot inside `identity_dir`.
    pub window_key: String,
}

/// Errors from reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: derive_ws_url(DEFAULT_API_URL),
            user_token: None,
            reconnect: ReconnectConfig::default(),
            identity_dir: None,
            window_key: DEFAULT_WINDOW_KEY.to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                    |
    /// |------------------------------|----------------------------|
    /// | `COMFYUI_API_URL`            | `http://127.0.0.1:8188`    |
    /// | `COMFYUI_WS_URL`             | API URL with ws/wss scheme |
    /// | `COMFYUI_USER_TOKEN`         | unset                      |
    /// | `COMFYUI_RECONNECT_DELAY_MS` | `300`                      |
    /// | `COMFYUI_POLL_INTERVAL_MS`   | `1000`                     |
    /// | `COMFYUI_IDENTITY_DIR`       | unset (in-memory identity) |
    /// | `COMFYUI_WINDOW_KEY`         | `default`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = var("COMFYUI_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.into())
            .trim_end_matches('/')
            .to_string();

        let ws_url = var("COMFYUI_WS_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&api_url));

        let reconnect = ReconnectConfig {
            reconnect_delay: parse_millis(
                "COMFYUI_RECONNECT_DELAY_MS",
                var("COMFYUI_RECONNECT_DELAY_MS"),
                DEFAULT_RECONNECT_DELAY,
            )?,
            poll_interval: parse_millis(
                "COMFYUI_POLL_INTERVAL_MS",
                var("COMFYUI_POLL_INTERVAL_MS"),
                DEFAULT_POLL_INTERVAL,
            )?,
        };

        Ok(Self {
            api_url,
            ws_url,
            user_token: var("COMFYUI_USER_TOKEN"),
            reconnect,
            identity_dir: var("COMFYUI_IDENTITY_DIR").map(PathBuf::from),
            window_key: var("COMFYUI_WINDOW_KEY").unwrap_or_else(|| DEFAULT_WINDOW_KEY.into()),
        })
    }

    /// Build the session identity this configuration describes.
    pub fn identity(&self) -> SessionIdentity {
        let identity = match self.identity_dir {
            Some(ref dir) => {
                SessionIdentity::new(Box::new(FileIdentityStore::new(dir, &self.window_key)))
            }
            None => SessionIdentity::in_memory(),
        };
        identity.set_user_token(self.user_token.clone());
        identity
    }
}

/// Swap `http`/`https` for `ws`/`wss`, keeping host, port and path.
pub fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

fn parse_millis(
    var: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid {
                var,
                expected: "number of milliseconds",
                value: raw,
            }),
    }
}

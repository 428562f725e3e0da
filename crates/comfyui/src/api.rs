//! REST API client for the request channel.
//!
//! Wraps the backend HTTP API (queue snapshots, status polling, workflow
//! validation and execution, interruption, history, authentication) using
//! [`reqwest`]. Every request carries the session's `clientId` query
//! parameter and the `userToken` / `userId` headers when they are known.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::QueueStatus;
use crate::session::SessionIdentity;
use crate::tracker::QueueSource;

/// Query parameter carrying the session identity.
pub const CLIENT_ID_PARAM: &str = "clientId";

/// Header carrying the user token.
pub const USER_TOKEN_HEADER: &str = "userToken";

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "userId";

/// Default number of history items fetched by [`ComfyUIApi::get_history`].
pub const DEFAULT_HISTORY_ITEMS: u32 = 200;

/// Validation result codes returned by `/validate_prompt`.
const CODE_OK: i64 = 0;
const CODE_WORKFLOW_NOT_FOUND: i64 = 1001;
const CODE_REJECTED: i64 = 1002;
const CODE_VALIDATION_FAILED: i64 = 1003;

/// HTTP client for a single backend instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    identity: Arc<SessionIdentity>,
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend answered but refused the request.
    #[error("Request rejected (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// The workflow failed validation; `node_errors` is keyed by node id.
    #[error("Workflow validation failed: {message}")]
    Validation { message: String, node_errors: Value },

    /// Validation succeeded without assigning a prompt id.
    #[error("Workflow validation failed: no prompt id assigned")]
    MissingPromptId,

    /// The user token was not accepted.
    #[error("Invalid user token")]
    InvalidToken,

    /// The configured base URL cannot be combined with a route.
    #[error("Invalid API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ---------------------------------------------------------------------------
// Queue snapshot
// ---------------------------------------------------------------------------

/// Running and pending submissions, as returned by `GET /queue`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(rename = "queue_running", default)]
    pub running: Vec<QueueEntry>,
    #[serde(rename = "queue_pending", default)]
    pub pending: Vec<QueueEntry>,
}

impl QueueSnapshot {
    /// Index of `prompt_id` in running-then-pending order.
    pub fn position_of(&self, prompt_id: &str) -> Option<usize> {
        self.running
            .iter()
            .chain(&self.pending)
            .position(|entry| entry.prompt_id == prompt_id)
    }

    /// Combined number of running and pending entries.
    pub fn total(&self) -> usize {
        self.running.len() + self.pending.len()
    }
}

/// One queue item.
///
/// The backend encodes items positionally as
/// `[number, prompt_id, prompt, extra_data, outputs]`; only the first two
/// are kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<Value>")]
pub struct QueueEntry {
    pub number: i64,
    pub prompt_id: String,
}

impl TryFrom<Vec<Value>> for QueueEntry {
    type Error = String;

    fn try_from(items: Vec<Value>) -> Result<Self, Self::Error> {
        let number = items
            .first()
            .and_then(Value::as_i64)
            .ok_or("queue entry is missing its number")?;
        let prompt_id = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or("queue entry is missing its prompt id")?
            .to_string();
        Ok(Self { number, prompt_id })
    }
}

// ---------------------------------------------------------------------------
// Submission types
// ---------------------------------------------------------------------------

/// Body sent to `/validate_prompt`.
#[derive(Debug, Clone, Serialize)]
pub struct PromptPayload {
    /// API-format graph keyed by node id.
    pub prompt: Value,
    pub extra_data: ExtraData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Insert at the front of the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front: Option<bool>,
    /// Explicit queue position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
}

/// `extra_data` wrapper carrying the editor workflow.
#[derive(Debug, Clone, Serialize)]
pub struct ExtraData {
    pub extra_pnginfo: ExtraPngInfo,
}

/// Editor workflow embedded in generated images.
#[derive(Debug, Clone, Serialize)]
pub struct ExtraPngInfo {
    pub workflow: Value,
}

/// Successful `/validate_prompt` response.
#[derive(Debug, Clone)]
pub struct ValidateResponse {
    pub code: i64,
    pub prompt_id: Option<String>,
    pub node_errors: Value,
    /// Any further fields the backend returned.
    pub extra: Map<String, Value>,
}

/// Raw `/validate_prompt` body before field renaming.
#[derive(Debug, Deserialize)]
struct RawValidateResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    node_error: Value,
    #[serde(default)]
    error: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// A validated submission ready to be tracked.
#[derive(Debug, Clone)]
pub struct QueuedPrompt {
    pub prompt_id: String,
    /// Every node id in the submitted graph.
    pub node_ids: Vec<String>,
    pub response: ValidateResponse,
}

/// Response returned by `/execute/{prompt_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default, alias = "node_error")]
    pub node_errors: Value,
}

/// Response returned by the `/prompt` endpoint after successfully
/// queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    #[serde(default)]
    pub node_errors: Value,
}

/// Identity returned by `/authenticate`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Lists that support item deletion and clearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemList {
    Queue,
    History,
}

impl ItemList {
    fn route(self) -> &'static str {
        match self {
            Self::Queue => "/queue",
            Self::History => "/history",
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl ComfyUIApi {
    /// Create a new API client.
    ///
    /// * `api_url`  - Base HTTP URL, e.g. `http://host:8188`.
    /// * `identity` - session identity shared with the realtime channel.
    pub fn new(api_url: String, identity: Arc<SessionIdentity>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, identity)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        api_url: String,
        identity: Arc<SessionIdentity>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            identity,
        }
    }

    /// Base HTTP URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Session identity used by this client.
    pub fn identity(&self) -> &Arc<SessionIdentity> {
        &self.identity
    }

    /// Build the full URL for `route`, adding `clientId` unless the route
    /// already carries one.
    pub fn url(&self, route: &str) -> Result<reqwest::Url, ComfyUIApiError> {
        let raw = format!("{}{}", self.api_url, route);
        let mut url = reqwest::Url::parse(&raw).map_err(|e| ComfyUIApiError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;

        let has_client_id = url.query_pairs().any(|(key, _)| key == CLIENT_ID_PARAM);
        if !has_client_id {
            if let Some(client_id) = self.identity.client_id() {
                url.query_pairs_mut().append_pair(CLIENT_ID_PARAM, &client_id);
            }
        }
        Ok(url)
    }

    /// Fetch the running and pending queues (`GET /queue`).
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self.request(reqwest::Method::GET, "/queue")?.send().await?;
        Self::parse_response(response).await
    }

    /// Fetch the queue status (`GET /prompt`). Used by the polling fallback.
    pub async fn get_status(&self) -> Result<QueueStatus, ComfyUIApiError> {
        let response = self.request(reqwest::Method::GET, "/prompt")?.send().await?;
        Self::parse_response(response).await
    }

    /// Validate a workflow (`POST /validate_prompt`) without executing it.
    pub async fn validate_prompt(
        &self,
        payload: &PromptPayload,
    ) -> Result<ValidateResponse, ComfyUIApiError> {
        let response = self
            .request(reqwest::Method::POST, "/validate_prompt")?
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let raw: RawValidateResponse = match serde_json::from_str(&body) {
            Ok(raw) => raw,
            Err(_) => {
                return Err(ComfyUIApiError::ApiError {
                    status: status.as_u16(),
                    body,
                })
            }
        };

        let message = raw.error.as_ref().map(error_text);
        match raw.code {
            CODE_WORKFLOW_NOT_FOUND => {
                return Err(ComfyUIApiError::Rejected {
                    code: raw.code,
                    message: message.unwrap_or_else(|| "not found workflow data".into()),
                })
            }
            CODE_REJECTED => {
                return Err(ComfyUIApiError::Rejected {
                    code: raw.code,
                    message: message.unwrap_or_default(),
                })
            }
            CODE_VALIDATION_FAILED => {
                return Err(ComfyUIApiError::Validation {
                    message: message.unwrap_or_default(),
                    node_errors: raw.node_error,
                })
            }
            _ => {}
        }

        if !status.is_success() || raw.code != CODE_OK {
            return Err(ComfyUIApiError::Rejected {
                code: raw.code,
                message: message.unwrap_or_else(|| format!("HTTP {status}")),
            });
        }

        Ok(ValidateResponse {
            code: raw.code,
            prompt_id: raw.run_id,
            node_errors: raw.node_error,
            extra: raw.extra,
        })
    }

    /// Validate an API-format graph and return the assigned prompt id with
    /// the graph's node ids.
    ///
    /// * `number` - `-1` queues at the front, `0` appends, anything else is
    ///   an explicit position.
    pub async fn queue_prompt(
        &self,
        number: i64,
        output: &Value,
        workflow: Value,
        flow_id: Option<String>,
    ) -> Result<QueuedPrompt, ComfyUIApiError> {
        let payload = PromptPayload {
            prompt: output.clone(),
            extra_data: ExtraData {
                extra_pnginfo: ExtraPngInfo { workflow },
            },
            client_id: self.identity.client_id(),
            flow_id,
            front: (number == -1).then_some(true),
            number: (number != -1 && number != 0).then_some(number),
        };

        let response = self.validate_prompt(&payload).await?;
        let prompt_id = response
            .prompt_id
            .clone()
            .ok_or(ComfyUIApiError::MissingPromptId)?;

        let node_ids = output
            .as_object()
            .map(|graph| graph.keys().cloned().collect())
            .unwrap_or_default();

        tracing::info!(prompt_id = %prompt_id, "Workflow validated");

        Ok(QueuedPrompt {
            prompt_id,
            node_ids,
            response,
        })
    }

    /// Start a validated prompt (`POST /execute/{prompt_id}`).
    pub async fn execute_prompt(&self, prompt_id: &str) -> Result<ExecuteResponse, ComfyUIApiError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/execute/{prompt_id}"))?
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Submit a workflow for execution directly (`POST /prompt`).
    pub async fn submit_workflow(&self, workflow: &Value) -> Result<SubmitResponse, ComfyUIApiError> {
        let client_id = self
            .identity
            .client_id()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .request(reqwest::Method::POST, "/prompt")?
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Interrupt the currently running execution (`POST /interrupt`).
    ///
    /// This does not target a specific prompt.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self.request(reqwest::Method::POST, "/interrupt")?.send().await?;
        Self::check_status(response).await
    }

    /// Delete one item from the queue or history.
    pub async fn delete_item(&self, list: ItemList, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let response = self
            .request(reqwest::Method::POST, list.route())?
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Clear the queue or history.
    pub async fn clear_items(&self, list: ItemList) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "clear": true });
        let response = self
            .request(reqwest::Method::POST, list.route())?
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Retrieve up to `max_items` history entries.
    pub async fn get_history(&self, max_items: u32) -> Result<Vec<Value>, ComfyUIApiError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/history?max_items={max_items}"),
            )?
            .send()
            .await?;
        let history: Map<String, Value> = Self::parse_response(response).await?;
        Ok(history.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Authenticate with `user_token` (`GET /authenticate`).
    ///
    /// Stores the token and user id for later requests. When no client id is
    /// known yet, the one returned here is adopted so that the socket and
    /// requests hash to the same backend.
    pub async fn authenticate(&self, user_token: &str) -> Result<UserInfo, ComfyUIApiError> {
        self.identity.set_user_token(Some(user_token.to_string()));

        let response = self.request(reqwest::Method::GET, "/authenticate")?.send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ComfyUIApiError::InvalidToken);
        }
        let info: UserInfo = Self::parse_response(response).await?;

        self.identity.set_user_id(Some(info.user_id.clone()));
        if let Some(ref client_id) = info.client_id {
            if let Err(e) = self.identity.adopt_if_absent(client_id) {
                tracing::error!(error = %e, "Failed to persist client identity");
            }
        }

        tracing::info!(user_id = %info.user_id, "Authenticated");
        Ok(info)
    }

    // ---- private helpers ----

    /// Start a request with identity query parameter and auth headers.
    fn request(
        &self,
        method: reqwest::Method,
        route: &str,
    ) -> Result<reqwest::RequestBuilder, ComfyUIApiError> {
        let mut builder = self.client.request(method, self.url(route)?);
        let credentials = self.identity.credentials();
        if let Some(token) = credentials.user_token {
            builder = builder.header(USER_TOKEN_HEADER, token);
        }
        if let Some(user_id) = credentials.user_id {
            builder = builder.header(USER_ID_HEADER, user_id);
        }
        Ok(builder)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueSource for ComfyUIApi {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        self.get_queue().await
    }
}

/// Render a backend `error` field (string or structured) as text.
fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

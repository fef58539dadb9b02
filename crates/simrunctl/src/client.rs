//! HTTP client for the simrund daemon.

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use simrun_core::{ListScope, RunDescriptor, RunEvent, RunId, RunRecord, RunState, RunSummary};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: simrund\n  → or set SIMRUND_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check SIMRUND_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure simrund is running\n  → check SIMRUND_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /runs.
#[derive(Debug, Serialize)]
pub struct SubmitRunRequest {
    #[serde(flatten)]
    pub descriptor: RunDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_alias: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitRunResponse {
    run_id: RunId,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<RunSummary>,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: RunRecord,
}

/// Response from POST /runs/{id}/cancel.
#[derive(Debug, Deserialize)]
pub struct CancelResponse {
    pub outcome: String,
    pub state: RunState,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for simrund.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Probe /health. Err if the daemon cannot be reached.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            if let Ok(true) = self.check_health().await {
                return Ok(());
            }
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            if elapsed >= timeout_ms {
                return Err(ClientError::DaemonNotReady {
                    addr: self.base_url.clone(),
                    timeout_ms,
                });
            }

            eprintln!(
                "waiting for daemon at {} (retrying in {}ms)",
                self.base_url, backoff_ms
            );

            let sleep_ms = backoff_ms.min(timeout_ms.saturating_sub(elapsed));
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(2);
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            404 => ClientError::RunNotFound(message),
            409 => ClientError::Conflict(message),
            400 => ClientError::InvalidArgument(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// POST /runs
    pub async fn submit_run(&self, req: &SubmitRunRequest) -> Result<RunId, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(req)
            .send()
            .await?;
        let body: SubmitRunResponse = Self::decode(response).await?;
        Ok(body.run_id)
    }

    /// GET /runs?scope=...
    pub async fn list_runs(&self, scope: ListScope) -> Result<Vec<RunSummary>, ClientError> {
        let url = format!("{}/runs?scope={}", self.base_url, scope.as_str());
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListRunsResponse = Self::decode(response).await?;
        Ok(body.runs)
    }

    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, ClientError> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: GetRunResponse = Self::decode(response).await?;
        Ok(body.run)
    }

    /// POST /runs/{id}/cancel
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelResponse, ClientError> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        Self::decode(response).await
    }

    /// DELETE /runs/{id}
    pub async fn purge_run(&self, run_id: &str) -> Result<RunRecord, ClientError> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        let body: GetRunResponse = Self::decode(response).await?;
        Ok(body.run)
    }

    /// Follow GET /runs/{id}/events until the stream closes, handing each
    /// event to `on_event`. Returns the last state seen.
    pub async fn watch_run(
        &self,
        run_id: &str,
        mut on_event: impl FnMut(&RunEvent),
    ) -> Result<Option<RunState>, ClientError> {
        let url = format!("{}/runs/{}/events", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut last_state = None;

        let mut handle = |event: RunEvent| {
            if let Some(state) = event.state() {
                last_state = Some(state);
            }
            on_event(&event);
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line.
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer.drain(..end + 2);
                if let Some(event) = parse_sse_event(&event_str) {
                    handle(event);
                }
            }
        }

        if let Some(event) = parse_sse_event(&buffer) {
            handle(event);
        }

        Ok(last_state)
    }
}

/// Parse one SSE event block into a run event. Keepalives and unknown
/// payloads yield `None`.
fn parse_sse_event(event_str: &str) -> Option<RunEvent> {
    let mut event_type = None;
    let mut data = None;

    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
    }

    match event_type {
        Some("state" | "output") => serde_json::from_str(data?).ok(),
        _ => None,
    }
}

//! Client for the notebook server's REST surface.
//!
//! Every name-taking call normalizes the notebook name first, so an invalid
//! name is rejected before any request goes out.

use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::cell::Output;
use crate::completion::Completion;
use crate::notebook::{KernelStatus, NotebookDocument};
use crate::notebook_name::{self, NameError};

/// Error type for REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Server URL cannot be used as a base: {0}")]
    InvalidBase(String),

    #[error(transparent)]
    Name(#[from] NameError),
}

#[derive(Deserialize)]
struct NotebookList {
    #[serde(default)]
    notebooks: Vec<String>,
}

#[derive(Deserialize)]
struct KernelStatusReply {
    status: String,
}

#[derive(Deserialize)]
struct ExecuteReply {
    #[serde(default)]
    outputs: Vec<Output>,
}

#[derive(Deserialize)]
struct CompleteReply {
    #[serde(default)]
    completions: Option<Completion>,
}

/// FastAPI-style error body.
#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// REST client bound to one server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidBase(base_url.to_string()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `{base}/api/v1/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBase(self.base.to_string()))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    /// WebSocket URL for the real-time channel on the same host.
    pub fn websocket_url(&self, ws_path: &str) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::InvalidBase(self.base.to_string()))?;
        url.set_path(ws_path);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody {
                detail: serde_json::Value::String(s),
            }) => s,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) if body.is_empty() => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
            Err(_) => body,
        };
        warn!("[notebook-api] {} {}", status.as_u16(), detail);
        Err(ApiError::Status {
            status: status.as_u16(),
            detail,
        })
    }

    // ── Notebooks ───────────────────────────────────────────────────

    pub async fn list_notebooks(&self) -> Result<Vec<String>, ApiError> {
        let url = self.endpoint(&["notebooks"])?;
        let response = Self::check(self.http.get(url).send().await?).await?;
        Ok(response.json::<NotebookList>().await?.notebooks)
    }

    /// Create a notebook. Returns the normalized name.
    pub async fn create_notebook(&self, name: &str) -> Result<String, ApiError> {
        let name = notebook_name::normalize(name)?;
        let url = self.endpoint(&["notebooks", &name])?;
        Self::check(self.http.post(url).send().await?).await?;
        debug!("[notebook-api] Created {}", name);
        Ok(name)
    }

    pub async fn get_notebook(&self, name: &str) -> Result<NotebookDocument, ApiError> {
        let name = notebook_name::normalize(name)?;
        let url = self.endpoint(&["notebooks", &name])?;
        let response = Self::check(self.http.get(url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Persist the whole notebook.
    pub async fn save_notebook(&self, name: &str, doc: &NotebookDocument) -> Result<(), ApiError> {
        let name = notebook_name::normalize(name)?;
        let url = self.endpoint(&["notebooks", &name])?;
        Self::check(self.http.put(url).json(doc).send().await?).await?;
        debug!("[notebook-api] Saved {} ({} cells)", name, doc.cells.len());
        Ok(())
    }

    pub async fn delete_notebook(&self, name: &str) -> Result<(), ApiError> {
        let name = notebook_name::normalize(name)?;
        let url = self.endpoint(&["notebooks", &name])?;
        Self::check(self.http.delete(url).send().await?).await?;
        Ok(())
    }

    // ── Kernel ──────────────────────────────────────────────────────

    pub async fn kernel_status(&self) -> Result<KernelStatus, ApiError> {
        let url = self.endpoint(&["kernel", "status"])?;
        let response = Self::check(self.http.get(url).send().await?).await?;
        let reply: KernelStatusReply = response.json().await?;
        Ok(KernelStatus::from_server(&reply.status))
    }

    pub async fn reset_kernel(&self) -> Result<(), ApiError> {
        let url = self.endpoint(&["kernel", "reset"])?;
        Self::check(self.http.post(url).send().await?).await?;
        Ok(())
    }

    pub async fn ensure_kernel(&self) -> Result<(), ApiError> {
        let url = self.endpoint(&["kernel", "ensure"])?;
        Self::check(self.http.post(url).send().await?).await?;
        Ok(())
    }

    // ── Execution & completion ──────────────────────────────────────

    /// Non-streaming execution; returns all outputs at once.
    pub async fn execute(&self, code: &str) -> Result<Vec<Output>, ApiError> {
        let url = self.endpoint(&["execute"])?;
        let response =
            Self::check(self.http.post(url).json(&json!({ "code": code })).send().await?).await?;
        Ok(response.json::<ExecuteReply>().await?.outputs)
    }

    pub async fn complete(&self, code: &str, cursor_pos: usize) -> Result<Completion, ApiError> {
        let url = self.endpoint(&["complete"])?;
        let body = json!({ "code": code, "cursor_pos": cursor_pos });
        let response = Self::check(self.http.post(url).json(&body).send().await?).await?;
        Ok(response
            .json::<CompleteReply>()
            .await?
            .completions
            .unwrap_or_default())
    }
}

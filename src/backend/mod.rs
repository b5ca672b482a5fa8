//! Chat backends.
//!
//! This module provides a unified interface over the local llamafile
//! server, Ollama-compatible servers, and the hosted OpenAI API. The variant
//! is chosen once at startup from the resolved configuration.

pub mod local;
pub mod ollama;
pub mod openai;

use crate::config::BackendConfig;
use crate::credentials::Token;
use crate::error::{ClientError, Result};
use crate::protocol::{ChatCompletion, ChatMessage};
use crate::stream::CompletionStream;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Reply to a chat completion request.
pub enum ChatResponse {
    /// The whole body, parsed.
    Complete(ChatCompletion),
    /// The open response, not yet read.
    Stream(CompletionStream),
}

impl ChatResponse {
    pub fn into_completion(self) -> Result<ChatCompletion> {
        match self {
            ChatResponse::Complete(completion) => Ok(completion),
            ChatResponse::Stream(_) => Err(ClientError::UnexpectedResponse(
                "expected a buffered completion, got a stream".to_string(),
            )),
        }
    }

    pub fn into_stream(self) -> Result<CompletionStream> {
        match self {
            ChatResponse::Stream(stream) => Ok(stream),
            ChatResponse::Complete(_) => Err(ClientError::UnexpectedResponse(
                "expected a stream, got a buffered completion".to_string(),
            )),
        }
    }
}

/// Reachability of a backend as seen by [`ChatBackend::get_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Running,
    NotRunning,
    Error(String),
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Running => f.write_str("running"),
            BackendStatus::NotRunning => f.write_str("not running"),
            BackendStatus::Error(message) => write!(f, "error ({})", message),
        }
    }
}

impl BackendStatus {
    /// Classify a failed probe: unreachable servers are "not running".
    fn from_error(err: &ClientError) -> Self {
        match err {
            ClientError::Http(e) if e.is_connect() || e.is_timeout() => BackendStatus::NotRunning,
            other => BackendStatus::Error(other.to_string()),
        }
    }
}

/// Informational metadata about the active backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub provider: &'static str,
    pub model: String,
    pub endpoint: String,
    pub status: BackendStatus,
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Provider: {}", self.provider)?;
        writeln!(f, "Model: {}", self.model)?;
        writeln!(f, "Endpoint: {}", self.endpoint)?;
        write!(f, "Status: {}", self.status)
    }
}

/// Capabilities every backend offers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send the full transcript. `model` overrides the configured model.
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        stream: bool,
    ) -> Result<ChatResponse>;

    /// Best-effort metadata probe. Never fails.
    async fn get_info(&self) -> BackendInfo;
}

/// Enum-based backend for LLM providers.
pub enum Backend {
    Local(local::LocalBackend),
    Ollama(ollama::OllamaBackend),
    OpenAI(openai::OpenAIBackend),
}

impl Backend {
    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Ollama(_) => "ollama",
            Backend::OpenAI(_) => "openai",
        }
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        match self {
            Backend::Local(b) => &b.model,
            Backend::Ollama(b) => &b.model,
            Backend::OpenAI(b) => &b.model,
        }
    }
}

#[async_trait]
impl ChatBackend for Backend {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        stream: bool,
    ) -> Result<ChatResponse> {
        match self {
            Backend::Local(b) => b.chat_completion(messages, model, stream).await,
            Backend::Ollama(b) => b.chat_completion(messages, model, stream).await,
            Backend::OpenAI(b) => b.chat_completion(messages, model, stream).await,
        }
    }

    async fn get_info(&self) -> BackendInfo {
        match self {
            Backend::Local(b) => b.get_info().await,
            Backend::Ollama(b) => b.get_info().await,
            Backend::OpenAI(b) => b.get_info().await,
        }
    }
}

/// Create a backend from configuration. `local_url` and `token` are only
/// used by the local variant.
pub fn create_backend(config: &BackendConfig, local_url: &str, token: Option<Token>) -> Result<Backend> {
    let backend = match config {
        BackendConfig::Local { model } => Backend::Local(local::LocalBackend::new(
            local_url.to_string(),
            model.clone(),
            token,
        )?),
        BackendConfig::Ollama { model, host } => {
            Backend::Ollama(ollama::OllamaBackend::new(model.clone(), host.clone())?)
        }
        BackendConfig::OpenAI { model, api_key } => {
            Backend::OpenAI(openai::OpenAIBackend::new(model.clone(), api_key.clone())?)
        }
    };
    debug!("Using {} backend ({})", backend.name(), backend.model());
    Ok(backend)
}

/// HTTP client shared by the backends. No overall timeout: streamed replies
/// can take as long as the model needs.
pub(crate) fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Timeout for listing and health requests.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Send a prepared chat request and shape the reply.
pub(crate) async fn send_chat(request: RequestBuilder, stream: bool) -> Result<ChatResponse> {
    let response = request.send().await?;
    let status = response.status();
    debug!("Response status: {}", status);

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::request_failed(status, body));
    }

    if stream {
        return Ok(ChatResponse::Stream(CompletionStream::from_response(response)));
    }

    let body = response.text().await?;
    debug!("Response body: {}", body);
    Ok(ChatResponse::Complete(serde_json::from_str(&body)?))
}

//! Error types shared by the supervisor, transport, and session layers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failures surfaced by the core operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The llamafile executable could not be resolved.
    #[error("llamafile executable not found: {0}")]
    NotFound(String),

    /// The server process exited before it became healthy.
    #[error("llamafile failed to start (exit code {}): {output}", fmt_exit_code(.exit_code))]
    StartupFailure {
        exit_code: Option<i32>,
        output: String,
    },

    /// The health probe never succeeded.
    #[error("server did not become ready within {0:?}")]
    Timeout(Duration),

    /// A non-success HTTP status, with the raw body for diagnostics.
    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    /// The requested model is not in the provider's listing.
    #[error("model '{model}' is not available on {endpoint}")]
    UnknownModel { model: String, endpoint: String },

    #[error("OpenAI API key not found. Set OPENAI_API_KEY or add api_key to the config file")]
    MissingApiKey,

    #[error("invalid PID file {path}: {reason}")]
    InvalidPidFile { path: PathBuf, reason: String },

    #[error("failed to detach service process: {0}")]
    Daemonize(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}

impl ClientError {
    /// Build a `RequestFailed` from a status code and response body.
    pub fn request_failed(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        ClientError::RequestFailed {
            status: status.as_u16(),
            body: body.into(),
        }
    }
}

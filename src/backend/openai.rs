//! OpenAI backend implementation.
//!
//! Uses the hosted OpenAI chat completions API.

use super::{http_client, send_chat, BackendInfo, BackendStatus, ChatBackend, ChatResponse, PROBE_TIMEOUT};
use crate::error::{ClientError, Result};
use crate::protocol::{ChatMessage, ChatRequest};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

const OPENAI_API_BASE: &str = "https://api.openai.com";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// OpenAI backend for GPT API.
pub struct OpenAIBackend {
    pub model: String,
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl OpenAIBackend {
    /// Create a new OpenAI backend.
    pub fn new(model: String, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            model,
            api_key,
            base_url: OPENAI_API_BASE.to_string(),
            client: http_client()?,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Get the API key from environment or config.
    fn get_api_key(&self) -> Result<String> {
        resolve_api_key(std::env::var(API_KEY_ENV).ok(), self.api_key.as_deref())
    }
}

/// The environment wins over the config file; blank values count as unset.
fn resolve_api_key(env: Option<String>, configured: Option<&str>) -> Result<String> {
    env.filter(|k| !k.trim().is_empty())
        .or_else(|| {
            configured
                .filter(|k| !k.trim().is_empty())
                .map(str::to_string)
        })
        .ok_or(ClientError::MissingApiKey)
}

#[async_trait]
impl ChatBackend for OpenAIBackend {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        stream: bool,
    ) -> Result<ChatResponse> {
        let api_key = self.get_api_key()?;
        let request = ChatRequest {
            model: model.unwrap_or(&self.model),
            messages,
            stream,
        };
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!("POST {} ({} messages, stream={})", url, messages.len(), stream);

        let builder = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request);
        send_chat(builder, stream).await
    }

    async fn get_info(&self) -> BackendInfo {
        let endpoint = format!("{}/v1", self.base_url);
        let status = match self.get_api_key() {
            Err(e) => BackendStatus::Error(e.to_string()),
            Ok(api_key) => {
                let url = format!("{}/v1/models/{}", self.base_url, self.model);
                match self
                    .client
                    .get(&url)
                    .bearer_auth(api_key)
                    .timeout(PROBE_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => BackendStatus::Running,
                    Ok(response) => BackendStatus::Error(format!("status {}", response.status())),
                    Err(e) => BackendStatus::from_error(&ClientError::Http(e)),
                }
            }
        };
        BackendInfo {
            provider: "openai",
            model: self.model.clone(),
            endpoint,
            status,
        }
    }
}

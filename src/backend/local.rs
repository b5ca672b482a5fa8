//! Local llamafile backend.
//!
//! Talks to the supervised llamafile server over its OpenAI-compatible API.
//! Every request carries the service token as a bearer credential.

use super::{http_client, send_chat, BackendInfo, BackendStatus, ChatBackend, ChatResponse, PROBE_TIMEOUT};
use crate::credentials::Token;
use crate::error::{ClientError, Result};
use crate::protocol::{ChatMessage, ChatRequest, ModelList};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tracing::debug;

/// Backend for the supervised llamafile server.
pub struct LocalBackend {
    pub model: String,
    base_url: String,
    token: Option<Token>,
    client: Client,
}

impl LocalBackend {
    /// Create a new local backend pointed at `base_url`.
    pub fn new(base_url: String, model: String, token: Option<Token>) -> Result<Self> {
        Ok(Self {
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: http_client()?,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

/// Attach the bearer credential, if any.
fn authorize(request: RequestBuilder, token: Option<&Token>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token.as_str()),
        None => request,
    }
}

/// `GET /v1/models`: succeeds once the server is up and accepts the token.
/// A body that is not a model list still counts as healthy.
pub async fn probe_models(client: &Client, base_url: &str, token: Option<&Token>) -> Result<ModelList> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let response = authorize(client.get(&url), token)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(serde_json::from_str(&body).unwrap_or_default())
    } else {
        Err(ClientError::request_failed(status, body))
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        stream: bool,
    ) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: model.unwrap_or(&self.model),
            messages,
            stream,
        };
        let url = self.completions_url();
        debug!("POST {} ({} messages, stream={})", url, messages.len(), stream);

        let builder = authorize(self.client.post(&url), self.token.as_ref()).json(&request);
        send_chat(builder, stream).await
    }

    async fn get_info(&self) -> BackendInfo {
        let status = match probe_models(&self.client, &self.base_url, self.token.as_ref()).await {
            Ok(models) => {
                let served: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();
                debug!("Local server models: {:?}", served);
                BackendStatus::Running
            }
            Err(e) => {
                debug!("Local server probe failed: {}", e);
                BackendStatus::from_error(&e)
            }
        };
        BackendInfo {
            provider: "llamafile",
            model: self.model.clone(),
            endpoint: self.base_url.clone(),
            status,
        }
    }
}

//! Ollama backend implementation.
//!
//! Ollama serves an OpenAI-compatible `/v1` surface next to its native API.
//! Chats go through `/v1/chat/completions`; the native `/api/tags` listing is
//! used to check the model exists before the first request.

use super::{http_client, send_chat, BackendInfo, BackendStatus, ChatBackend, ChatResponse, PROBE_TIMEOUT};
use crate::error::{ClientError, Result};
use crate::protocol::{ChatMessage, ChatRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// Ollama backend for local or remote inference.
pub struct OllamaBackend {
    pub model: String,
    host: String,
    client: Client,
    /// Models already confirmed present on the server.
    validated: Mutex<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

impl OllamaBackend {
    /// Create a new Ollama backend.
    pub fn new(model: String, host: String) -> Result<Self> {
        Ok(Self {
            model,
            host: host.trim_end_matches('/').to_string(),
            client: http_client()?,
            validated: Mutex::new(HashSet::new()),
        })
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.host)
    }

    /// Names of the models installed on the server.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::request_failed(status, body));
        }

        let tags: TagList = response.json().await?;
        Ok(tags.models.into_iter().map(|t| t.name).collect())
    }

    /// Fail with `UnknownModel` unless the server has `model`.
    async fn ensure_model(&self, model: &str) -> Result<()> {
        if self.is_validated(model) {
            return Ok(());
        }

        let available = self.list_models().await?;
        debug!("Ollama models available: {:?}", available);
        if !available.iter().any(|name| model_matches(model, name)) {
            return Err(ClientError::UnknownModel {
                model: model.to_string(),
                endpoint: self.host.clone(),
            });
        }

        if let Ok(mut validated) = self.validated.lock() {
            validated.insert(model.to_string());
        }
        Ok(())
    }

    fn is_validated(&self, model: &str) -> bool {
        self.validated
            .lock()
            .map(|validated| validated.contains(model))
            .unwrap_or(false)
    }
}

/// A bare model name also matches its `:latest` tag.
fn model_matches(requested: &str, listed: &str) -> bool {
    if requested == listed {
        return true;
    }
    !requested.contains(':') && listed.strip_suffix(":latest") == Some(requested)
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        stream: bool,
    ) -> Result<ChatResponse> {
        let model = model.unwrap_or(&self.model);
        self.ensure_model(model).await?;

        let url = format!("{}/v1/chat/completions", self.host);
        debug!("POST {} ({} messages, stream={})", url, messages.len(), stream);
        let request = ChatRequest {
            model,
            messages,
            stream,
        };
        send_chat(self.client.post(&url).json(&request), stream).await
    }

    async fn get_info(&self) -> BackendInfo {
        let status = match self.list_models().await {
            Ok(models) if models.iter().any(|name| model_matches(&self.model, name)) => {
                BackendStatus::Running
            }
            Ok(_) => BackendStatus::Error(format!("model '{}' is not installed", self.model)),
            Err(e) => BackendStatus::from_error(&e),
        };
        BackendInfo {
            provider: "ollama",
            model: self.model.clone(),
            endpoint: self.host.clone(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockResponse, MockServer};

    const TAGS: &str = r#"{"models":[{"name":"llama3.2:latest"},{"name":"mistral:7b"}]}"#;
    const REPLY: &str = r#"{"choices":[{"message":{"content":"Hi there"}}]}"#;

    async fn server() -> MockServer {
        MockServer::start(vec![
            ("GET /api/tags", MockResponse::json(200, TAGS)),
            ("POST /v1/chat/completions", MockResponse::json(200, REPLY)),
        ])
        .await
    }

    #[test]
    fn test_model_matches() {
        assert!(model_matches("llama3.2", "llama3.2:latest"));
        assert!(model_matches("mistral:7b", "mistral:7b"));
        assert!(!model_matches("mistral", "mistral:7b"));
        assert!(!model_matches("llama3.2:1b", "llama3.2:latest"));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let server = server().await;
        let backend = OllamaBackend::new("phi3".to_string(), server.base_url.clone()).unwrap();

        let err = match backend.chat_completion(&[ChatMessage::user("hi")], None, false).await {
            Ok(_) => panic!("expected UnknownModel"),
            Err(e) => e,
        };
        assert!(matches!(err, ClientError::UnknownModel { ref model, .. } if model == "phi3"));
        assert!(server
            .requests()
            .iter()
            .all(|r| r.path != "/v1/chat/completions"));
    }

    #[tokio::test]
    async fn test_validation_is_cached() {
        let server = server().await;
        let backend = OllamaBackend::new("llama3.2".to_string(), server.base_url.clone()).unwrap();

        for _ in 0..2 {
            let completion = backend
                .chat_completion(&[ChatMessage::user("hi")], None, false)
                .await
                .unwrap()
                .into_completion()
                .unwrap();
            assert_eq!(completion.content(), Some("Hi there"));
        }

        let requests = server.requests();
        let listings = requests.iter().filter(|r| r.path == "/api/tags").count();
        assert_eq!(listings, 1);
        let chat = requests
            .iter()
            .find(|r| r.path == "/v1/chat/completions")
            .unwrap();
        assert!(chat.header("authorization").is_none());
    }

    #[tokio::test]
    async fn test_get_info_reports_missing_model() {
        let server = server().await;
        let backend = OllamaBackend::new("phi3".to_string(), server.base_url.clone()).unwrap();

        let info = backend.get_info().await;
        assert_eq!(info.provider, "ollama");
        assert!(matches!(info.status, BackendStatus::Error(_)));
    }
}

//! Configuration management for sumarai.
//!
//! Configuration is loaded from `~/.config/sumarai/config.toml`. Service
//! state (PID file, API key, service log) lives under `~/.llamafile/`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default system prompt for chat and summaries.
pub const DEFAULT_PROMPT: &str =
    "You are a helpful AI assistant. Respond to the user's queries concisely and accurately.";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local llamafile server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend used for chat and summaries.
    #[serde(default)]
    pub backend: BackendConfig,
    /// System prompt override.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Settings for the supervised llamafile server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the llamafile executable (lower precedence than `--llamafile`).
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra arguments appended to the launch command.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            host: default_host(),
            port: default_port(),
            args: Vec::new(),
            startup_timeout_secs: default_startup_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl ServerConfig {
    /// Base URL of the local server, e.g. `http://localhost:8080`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stop_grace_secs() -> u64 {
    10
}

/// Backend configuration for LLM providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// The supervised llamafile server.
    Local {
        /// Model name sent in requests (llamafile ignores it).
        #[serde(default = "default_local_model")]
        model: String,
    },
    /// Ollama-compatible server.
    Ollama {
        /// Model name (default: llama3.2).
        #[serde(default = "default_ollama_model")]
        model: String,
        /// Ollama host URL (default: http://localhost:11434).
        #[serde(default = "default_ollama_host")]
        host: String,
    },
    /// OpenAI API.
    OpenAI {
        /// Model name (default: gpt-4o-mini).
        #[serde(default = "default_openai_model")]
        model: String,
        /// API key (prefer OPENAI_API_KEY env var).
        #[serde(default)]
        api_key: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            model: default_local_model(),
        }
    }
}

pub fn default_local_model() -> String {
    "local-model".to_string()
}

pub fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

pub fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

pub fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("sumarai"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Directory holding the PID file, API key, and service log.
    pub fn state_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|p| p.join(".llamafile"))
            .context("Could not determine home directory")
    }

    /// Load configuration from `path`, using defaults if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the backend type as a string.
    pub fn backend_type(&self) -> &'static str {
        match &self.backend {
            BackendConfig::Local { .. } => "local",
            BackendConfig::Ollama { .. } => "ollama",
            BackendConfig::OpenAI { .. } => "openai",
        }
    }

    /// Get the model name.
    pub fn model_name(&self) -> &str {
        match &self.backend {
            BackendConfig::Local { model } => model,
            BackendConfig::Ollama { model, .. } => model,
            BackendConfig::OpenAI { model, .. } => model,
        }
    }

    /// The system prompt, falling back to [`DEFAULT_PROMPT`].
    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }
}

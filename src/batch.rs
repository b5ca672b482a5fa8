//! One-shot summaries of files or standard input.

use crate::backend::ChatBackend;
use crate::protocol::ChatMessage;
use crate::stream::clean_content;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Printed when the reply carries no message content.
pub const NO_CONTENT: &str = "No content in response";

/// Where a document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchInput {
    Stdin,
    File(PathBuf),
}

impl fmt::Display for BatchInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchInput::Stdin => f.write_str("<stdin>"),
            BatchInput::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Interpret positional arguments. `-` means stdin and must stand alone.
pub fn parse_inputs(files: &[PathBuf]) -> Result<Vec<BatchInput>> {
    let is_stdin = |path: &PathBuf| path.as_path() == Path::new("-");
    if files.iter().any(is_stdin) {
        if files.len() > 1 {
            bail!("'-' (standard input) cannot be combined with other files");
        }
        return Ok(vec![BatchInput::Stdin]);
    }
    Ok(files.iter().cloned().map(BatchInput::File).collect())
}

async fn read_input(input: &BatchInput) -> Result<String> {
    match input {
        BatchInput::Stdin => {
            let mut content = String::new();
            tokio::io::stdin()
                .read_to_string(&mut content)
                .await
                .context("Failed to read standard input")?;
            Ok(content)
        }
        BatchInput::File(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// The single-message conversation used for a summary.
pub fn summary_request(prompt: &str, content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!("{}\n\n{}", prompt, content))]
}

/// Ask for a buffered completion of `prompt` applied to `content`.
pub async fn summarize_text<B: ChatBackend>(
    backend: &B,
    prompt: &str,
    content: &str,
) -> crate::error::Result<String> {
    let messages = summary_request(prompt, content);
    let completion = backend
        .chat_completion(&messages, None, false)
        .await?
        .into_completion()?;
    Ok(completion
        .content()
        .map(clean_content)
        .unwrap_or_else(|| NO_CONTENT.to_string()))
}

/// Summarize each input in order, printing one reply per input. The first
/// failure aborts the rest.
pub async fn summarize<B: ChatBackend, W: Write>(
    backend: &B,
    prompt: &str,
    inputs: &[BatchInput],
    out: &mut W,
) -> Result<()> {
    for input in inputs {
        let content = read_input(input).await?;
        debug!("Summarizing {} ({} bytes)", input, content.len());
        let summary = summarize_text(backend, prompt, &content)
            .await
            .with_context(|| format!("Failed to summarize {}", input))?;
        writeln!(out, "{}", summary)?;
        out.flush()?;
    }
    Ok(())
}

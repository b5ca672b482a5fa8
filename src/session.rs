//! Interactive chat shell.
//!
//! Reads lines from the user, streams each reply from the backend as it
//! arrives, and keeps the conversation in a [`Transcript`].

use crate::backend::ChatBackend;
use crate::error::Result;
use crate::transcript::Transcript;
use crossterm::style::Stylize;
use std::future::Future;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

pub const BANNER: &str =
    "Welcome to the interactive shell. Type 'help' for available commands or 'exit' to quit.";
const GOODBYE: &str = "Exiting interactive shell.";
const HELP: &str = "Available commands:
  help    - Show this help message
  clear   - Clear the conversation history
  info    - Show backend information
  exit    - Exit the interactive shell";

/// A line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Clear,
    Info,
    Exit,
    Empty,
    Message(String),
}

impl Command {
    /// Commands are matched case-insensitively after trimming.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Command::Empty,
            "help" => Command::Help,
            "clear" => Command::Clear,
            "info" => Command::Info,
            "exit" => Command::Exit,
            _ => Command::Message(trimmed.to_string()),
        }
    }
}

pub struct Session<'a, B: ChatBackend> {
    backend: &'a B,
    transcript: Transcript,
    color: bool,
}

impl<'a, B: ChatBackend> Session<'a, B> {
    pub fn new(backend: &'a B, system_prompt: &str) -> Self {
        Self {
            backend,
            transcript: Transcript::new(system_prompt),
            color: atty::is(atty::Stream::Stdout),
        }
    }

    #[cfg(test)]
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    #[cfg(test)]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    fn you(&self) -> String {
        if self.color {
            "You: ".green().bold().to_string()
        } else {
            "You: ".to_string()
        }
    }

    fn ai(&self) -> String {
        if self.color {
            "AI: ".cyan().bold().to_string()
        } else {
            "AI: ".to_string()
        }
    }

    /// Run until `exit`, end of input, or `interrupt` resolves.
    ///
    /// A line that is not valid UTF-8 is reported and skipped.
    pub async fn run<R, W, S>(&mut self, mut input: R, out: &mut W, interrupt: S) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
        S: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        let mut buf = Vec::new();
        writeln!(out, "{}", BANNER)?;

        loop {
            write!(out, "{}", self.you())?;
            out.flush()?;

            buf.clear();
            let read = tokio::select! {
                _ = &mut interrupt => None,
                read = input.read_until(b'\n', &mut buf) => Some(read?),
            };
            let line = match read {
                // End of input.
                Some(0) => {
                    writeln!(out)?;
                    break;
                }
                Some(_) => match String::from_utf8(std::mem::take(&mut buf)) {
                    Ok(line) => line,
                    Err(e) => {
                        debug!("Skipping undecodable input line: {:?}", e);
                        writeln!(out, "An error occurred: {}", e)?;
                        continue;
                    }
                },
                None => {
                    writeln!(out, "\n{}", GOODBYE)?;
                    break;
                }
            };

            match Command::parse(&line) {
                Command::Empty => {}
                Command::Help => writeln!(out, "{}", HELP)?,
                Command::Clear => {
                    self.transcript.clear();
                    writeln!(out, "Conversation history cleared.")?;
                }
                Command::Info => {
                    let info = self.backend.get_info().await;
                    writeln!(out, "{}", info)?;
                }
                Command::Exit => {
                    writeln!(out, "{}", GOODBYE)?;
                    break;
                }
                Command::Message(text) => {
                    let turn = tokio::select! {
                        _ = &mut interrupt => None,
                        result = self.exchange(text, out) => Some(result),
                    };
                    match turn {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            debug!("Turn failed: {:?}", e);
                            self.transcript.pop_last_user();
                            writeln!(out, "An error occurred: {}", e)?;
                        }
                        None => {
                            writeln!(out, "\n{}", GOODBYE)?;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Send one user message and stream the reply to `out`.
    async fn exchange<W: Write>(&mut self, text: String, out: &mut W) -> Result<()> {
        self.transcript.push_user(text);
        let stream = self
            .backend
            .chat_completion(self.transcript.messages(), None, true)
            .await?
            .into_stream()?;

        write!(out, "{}", self.ai())?;
        out.flush()?;

        let mut write_error = None;
        let reply = stream
            .collect_text(|delta| {
                if write_error.is_none() {
                    if let Err(e) = write!(out, "{}", delta).and_then(|_| out.flush()) {
                        write_error = Some(e);
                    }
                }
            })
            .await;
        // The reply line is finished even when the stream broke off.
        writeln!(out)?;
        let reply = reply?;
        if let Some(e) = write_error {
            return Err(e.into());
        }

        self.transcript.push_assistant(reply);
        Ok(())
    }
}

//! Reassembly of streamed chat completions.
//!
//! A streamed response is a sequence of server-sent-event lines of the form
//! `data: <json>`, ending with `data: [DONE]`. Network reads split that text
//! at arbitrary points, so bytes are buffered until a full line is available.
//! A payload that does not parse yet is held in the `Incomplete` state and
//! retried when the next line arrives.

use crate::error::{ClientError, Result};
use crate::protocol::StreamChunk;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, trace};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Upper bound on a held-back fragment before it is discarded.
const MAX_INCOMPLETE_LEN: usize = 1 << 20;

/// Control tokens some models leak into their output.
const CONTROL_TOKENS: &[&str] = &["<|eot_id|>", "<|im_end|>", "<|endoftext|>", "</s>"];

/// Strip non-semantic control tokens from model output.
pub fn clean_content(content: &str) -> String {
    CONTROL_TOKENS
        .iter()
        .fold(content.to_string(), |acc, token| acc.replace(token, ""))
}

/// One decoded unit of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Incremental assistant content.
    Delta(String),
    /// The server signalled the end of the reply.
    Done,
    /// A frame without content, e.g. a role-only heartbeat.
    Empty,
    /// The server reported an error in-band and ended the reply.
    Error(String),
}

#[derive(Debug, Default)]
enum ParserState {
    #[default]
    Idle,
    /// A `data:` payload that did not parse; more text may complete it.
    Incomplete(String),
    Finished,
}

/// Incremental SSE parser. Feed it raw body chunks in order.
#[derive(Debug, Default)]
pub struct SseReassembler {
    /// Trailing bytes of a UTF-8 sequence split across chunks.
    undecoded: Vec<u8>,
    /// Decoded text not yet terminated by a newline.
    buffer: String,
    state: ParserState,
}

impl SseReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ParserState::Finished)
    }

    /// Append a chunk and return every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if self.is_finished() {
            return frames;
        }
        self.decode(chunk);
        while !self.is_finished() {
            let Some(pos) = self.buffer.find('\n') else {
                break;
            };
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
            self.process_line(line, &mut frames);
        }
        frames
    }

    /// Signal end of input. An unterminated final line is processed; a
    /// still-incomplete payload is dropped.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if self.is_finished() {
            return frames;
        }
        if !self.undecoded.is_empty() {
            let tail = String::from_utf8_lossy(&self.undecoded).into_owned();
            self.buffer.push_str(&tail);
            self.undecoded.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end_matches(|c: char| c == '\n' || c == '\r');
        if !rest.is_empty() {
            self.process_line(rest, &mut frames);
        }
        if let ParserState::Incomplete(fragment) = &self.state {
            debug!("Discarding incomplete stream frame at end of body: {}", fragment);
        }
        self.state = ParserState::Finished;
        frames
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.undecoded.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.undecoded) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.undecoded.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(std::str::from_utf8(&self.undecoded[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.drain(..valid + len);
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            self.undecoded.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<StreamFrame>) {
        if let ParserState::Incomplete(fragment) = std::mem::take(&mut self.state) {
            if !line.starts_with(DATA_PREFIX) {
                let joined = fragment + line;
                self.handle_payload(joined, frames);
                return;
            }
            debug!("Dropping malformed stream frame: {}", fragment);
        }

        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            trace!("Ignoring non-data line: {:?}", line);
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim() == DONE_SENTINEL {
            frames.push(StreamFrame::Done);
            self.state = ParserState::Finished;
            return;
        }
        self.handle_payload(payload.to_string(), frames);
    }

    fn handle_payload(&mut self, payload: String, frames: &mut Vec<StreamFrame>) {
        match serde_json::from_str::<StreamChunk>(&payload) {
            Ok(chunk) => {
                let done = push_chunk_frames(chunk, frames);
                self.state = if done {
                    ParserState::Finished
                } else {
                    ParserState::Idle
                };
            }
            Err(e) if payload.len() < MAX_INCOMPLETE_LEN => {
                trace!("Holding incomplete stream frame ({})", e);
                self.state = ParserState::Incomplete(payload);
            }
            Err(e) => {
                debug!("Discarding oversized malformed stream frame: {}", e);
                self.state = ParserState::Idle;
            }
        }
    }
}

/// Push the frames for one parsed chunk. Returns true when it was terminal.
fn push_chunk_frames(chunk: StreamChunk, frames: &mut Vec<StreamFrame>) -> bool {
    if let Some(message) = chunk.error_message() {
        frames.push(StreamFrame::Error(message));
        return true;
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        frames.push(StreamFrame::Empty);
        return false;
    };

    let mut emitted = false;
    if let Some(content) = choice.delta.content {
        let cleaned = clean_content(&content);
        if !cleaned.is_empty() {
            frames.push(StreamFrame::Delta(cleaned));
            emitted = true;
        }
    }
    if choice.finish_reason.is_some() {
        frames.push(StreamFrame::Done);
        return true;
    }
    if !emitted {
        frames.push(StreamFrame::Empty);
    }
    false
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A live streamed completion. Dropping it closes the connection.
pub struct CompletionStream {
    body: Option<ByteStream>,
    reassembler: SseReassembler,
    pending: VecDeque<StreamFrame>,
    accumulated: String,
}

impl CompletionStream {
    /// Wrap an open HTTP response without consuming it.
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::from_byte_stream(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ClientError::from)),
        )
    }

    pub fn from_byte_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            body: Some(Box::pin(stream)),
            reassembler: SseReassembler::new(),
            pending: VecDeque::new(),
            accumulated: String::new(),
        }
    }

    /// Next frame, or `None` once the stream is exhausted.
    pub async fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                match &frame {
                    StreamFrame::Delta(text) => self.accumulated.push_str(text),
                    StreamFrame::Done => self.close(),
                    StreamFrame::Empty => {}
                    StreamFrame::Error(message) => {
                        self.close();
                        self.pending.clear();
                        return Err(ClientError::UnexpectedResponse(format!(
                            "server error in stream: {}",
                            message
                        )));
                    }
                }
                return Ok(Some(frame));
            }

            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            match body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.reassembler.feed(&chunk)),
                Some(Err(e)) => {
                    self.close();
                    return Err(e);
                }
                None => {
                    self.body = None;
                    self.pending.extend(self.reassembler.finish());
                }
            }
        }
    }

    /// Text received so far, as emitted.
    #[allow(dead_code)]
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Release the connection without reading the rest of the body.
    pub fn close(&mut self) {
        self.body = None;
    }

    /// Drain the stream, calling `on_delta` for each piece of content, and
    /// return the cleaned full reply.
    pub async fn collect_text(mut self, mut on_delta: impl FnMut(&str)) -> Result<String> {
        while let Some(frame) = self.next_frame().await? {
            if let StreamFrame::Delta(text) = &frame {
                on_delta(text);
            }
        }
        Ok(clean_content(&self.accumulated))
    }
}

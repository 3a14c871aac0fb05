//! Server-sent event decoding: `data: ` lines in, JSON payloads out, one at a time.
//!
//! Frames are blank-line delimited; each `data:` line inside a frame carries one
//! complete JSON fragment and is emitted as soon as its line has been read.
//! Comment (`:`), `event:`, `id:` and `retry:` lines are ignored. The literal
//! `[DONE]` ends the stream. Payloads that fail to parse are skipped and counted.
//!
//! A chat stream can also end with an `{"error": {...}}` payload instead of
//! the sentinel; [`ChatStream`] turns that into an `Err` and stops.

use std::io::{BufRead, BufReader, Read};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::messages::{ChatChunk, ErrorBody};

const DATA_PREFIX: &str = "data:";
const SENTINEL: &str = "[DONE]";

/// One decoded unit of a streaming body.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Value),
    Done,
}

/// How a stream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The server sent `[DONE]`.
    Sentinel,
    /// The source hit EOF without a sentinel. Just as valid as `Sentinel`.
    Closed,
    /// Reading the source failed, or the server reported an error mid-stream.
    /// Either way the error was returned once.
    Aborted,
}

/// Lazy, forward-only decoder over any buffered byte source.
pub struct SseDecoder<R> {
    reader: R,
    line: Vec<u8>,
    skipped: usize,
    completion: Option<Completion>,
}

/// Decoder over a live HTTP body, as handed out by the engine.
pub type EventStream = SseDecoder<BufReader<Box<dyn Read + Send>>>;

impl<R: BufRead> SseDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            skipped: 0,
            completion: None,
        }
    }

    /// Number of payloads dropped because they were not valid JSON.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// `None` while the stream is still live.
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Read until the next event. `Ok(None)` once the stream is over.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        if self.completion.is_some() {
            return Ok(None);
        }
        loop {
            self.line.clear();
            let read = match self.reader.read_until(b'\n', &mut self.line) {
                Ok(n) => n,
                Err(e) => {
                    self.completion = Some(Completion::Aborted);
                    return Err(Error::network(format!("reading event stream: {e}")));
                }
            };
            if read == 0 {
                self.completion = Some(Completion::Closed);
                return Ok(None);
            }

            let text = String::from_utf8_lossy(&self.line);
            let line = text.trim_end_matches(['\n', '\r']);
            let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
                // Frame separators, comments and non-data fields.
                continue;
            };
            let payload = rest.strip_prefix(' ').unwrap_or(rest).trim_end();
            if payload == SENTINEL {
                self.completion = Some(Completion::Sentinel);
                return Ok(Some(StreamEvent::Done));
            }
            match serde_json::from_str::<Value>(payload) {
                Ok(value) => return Ok(Some(StreamEvent::Data(value))),
                Err(err) => {
                    self.skipped += 1;
                    debug!(%err, skipped = self.skipped, "skipping malformed event payload");
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for SseDecoder<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_event() {
            Ok(Some(StreamEvent::Data(value))) => Some(Ok(value)),
            Ok(Some(StreamEvent::Done)) | Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Text fragments of a streamed chat completion, in arrival order.
pub struct ChatStream {
    events: EventStream,
    failed: bool,
}

impl ChatStream {
    pub(crate) fn new(events: EventStream) -> Self {
        Self {
            events,
            failed: false,
        }
    }

    pub fn skipped(&self) -> usize {
        self.events.skipped()
    }

    pub fn completion(&self) -> Option<Completion> {
        if self.failed {
            return Some(Completion::Aborted);
        }
        self.events.completion()
    }

    /// Drain the remaining fragments into one string.
    pub fn collect_text(self) -> Result<String> {
        let mut text = String::new();
        for fragment in self {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Iterator for ChatStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let value = match self.events.next()? {
                Ok(value) => value,
                Err(e) => return Some(Err(e)),
            };
            if value.get("error").is_some_and(|e| !e.is_null()) {
                match serde_json::from_value::<ErrorBody>(value) {
                    Ok(body) => {
                        self.failed = true;
                        return Some(Err(in_band_error(body)));
                    }
                    Err(err) => {
                        debug!(%err, "ignoring unrecognized error payload");
                        continue;
                    }
                }
            }
            // Role-only and usage-only chunks carry no text.
            let Ok(chunk) = serde_json::from_value::<ChatChunk>(value) else {
                continue;
            };
            if let Some(content) = chunk.into_delta_content() {
                if !content.is_empty() {
                    return Some(Ok(content));
                }
            }
        }
    }
}

/// Error reported inside a 200 stream. The HTTP status is kept as 200.
fn in_band_error(body: ErrorBody) -> Error {
    let (message, code, details) = body.error.into_parts();
    let message = message.unwrap_or_else(|| "stream failed".to_string());
    warn!(%message, code = code.as_deref().unwrap_or(""), "server reported an error mid-stream");
    Error::Server {
        status: 200,
        message,
        code,
        details,
    }
}

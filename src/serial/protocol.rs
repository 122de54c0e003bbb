//! REPL read/write discipline.
//!
//! The interpreter answers every framed command by echoing output followed by
//! a fresh prompt. [`ReplProtocol`] is the pure state machine that decides,
//! chunk by chunk, whether inbound text belongs to an outstanding synchronous
//! exchange or should be streamed straight to the observer.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Carriage return sent before a command to provoke a prompt and after it to
/// make the interpreter execute and echo.
pub const FRAME_DELIMITER: char = '\r';

pub const PRIMARY_PROMPT: &str = "\r\n>>> ";
pub const BARE_PROMPT: &str = ">>> ";
pub const MISSING_FILE_DIAGNOSTIC: &str = "ENOENT";

/// Frame a command as `\r` + command + `\r`, UTF-8 encoded
pub fn frame_command(command: &str) -> Vec<u8> {
    let mut framed = String::with_capacity(command.len() + 2);
    framed.push(FRAME_DELIMITER);
    framed.push_str(command);
    framed.push(FRAME_DELIMITER);
    framed.into_bytes()
}

/// Byte sequences that mark protocol boundaries in the inbound stream.
///
/// Firmware versions differ in what trails the prompt, so both the sync and
/// trim sets carry a primary and an alternate form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelSet {
    /// Any of these anywhere in the accumulated reply ends a sync exchange
    pub sync_complete: Vec<String>,
    /// Stripped from the end of a streamed chunk, longest match first
    pub echo_trim: Vec<String>,
    /// Error markers that also end a sync exchange
    pub diagnostics: Vec<String>,
}

impl Default for SentinelSet {
    fn default() -> Self {
        Self {
            sync_complete: vec![PRIMARY_PROMPT.to_string(), BARE_PROMPT.to_string()],
            echo_trim: vec![PRIMARY_PROMPT.to_string(), BARE_PROMPT.to_string()],
            diagnostics: vec![MISSING_FILE_DIAGNOSTIC.to_string()],
        }
    }
}

impl SentinelSet {
    fn completes_sync(&self, text: &str) -> bool {
        self.sync_complete.iter().any(|s| !s.is_empty() && text.contains(s.as_str()))
    }

    fn diagnostic_in(&self, text: &str) -> Option<&str> {
        self.diagnostics
            .iter()
            .find(|d| !d.is_empty() && text.contains(d.as_str()))
            .map(String::as_str)
    }

    /// Strip the longest matching echo-trim suffix, if any
    pub fn trim_echo<'a>(&self, chunk: &'a str) -> &'a str {
        let mut candidates: Vec<&str> = self
            .echo_trim
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        candidates.sort_by_key(|s| std::cmp::Reverse(s.len()));

        candidates
            .into_iter()
            .find_map(|suffix| chunk.strip_suffix(suffix))
            .unwrap_or(chunk)
    }
}

/// Reply to a synchronous exchange.
///
/// `text` is everything received since the command went out, prompt included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub text: String,
    /// Set when a diagnostic marker, not a prompt, ended the exchange
    pub diagnostic: Option<String>,
}

impl SyncResponse {
    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic.is_some()
    }
}

/// Single-byte REPL control sequences, written unframed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSequence {
    /// Ctrl-A
    RawRepl,
    /// Ctrl-B
    FriendlyRepl,
    /// Ctrl-C
    Interrupt,
    /// Ctrl-D
    SoftReset,
    /// Ctrl-E
    PasteMode,
}

impl ControlSequence {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ControlSequence::RawRepl => b"\x01",
            ControlSequence::FriendlyRepl => b"\x02",
            ControlSequence::Interrupt => b"\x03",
            ControlSequence::SoftReset => b"\x04",
            ControlSequence::PasteMode => b"\x05",
        }
    }
}

#[derive(Debug)]
enum ReadMode<R> {
    Stream,
    /// Raw bytes, decoded once on completion so characters split across reads survive
    AwaitingSync { accumulator: Vec<u8>, responder: R },
}

/// What a single inbound chunk turned into
#[derive(Debug)]
pub enum Delivery<R> {
    /// Empty chunk in stream mode
    Dropped,
    /// Chunk appended to an unfinished sync reply
    Accumulated,
    Streamed(String),
    SyncComplete { responder: R, response: SyncResponse },
}

/// Mode state machine: `Stream -> AwaitingSync -> Stream`.
///
/// `R` is whatever completes a sync exchange; holding it inside the
/// `AwaitingSync` variant means a responder exists exactly while a reply is
/// being accumulated.
#[derive(Debug)]
pub struct ReplProtocol<R> {
    sentinels: SentinelSet,
    mode: ReadMode<R>,
    decode_errors: u64,
}

impl<R> ReplProtocol<R> {
    pub fn new(sentinels: SentinelSet) -> Self {
        Self {
            sentinels,
            mode: ReadMode::Stream,
            decode_errors: 0,
        }
    }

    pub fn is_awaiting_sync(&self) -> bool {
        matches!(self.mode, ReadMode::AwaitingSync { .. })
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// Enter sync mode with an empty accumulator.
    ///
    /// Hands the responder back if another exchange is outstanding.
    pub fn begin_sync(&mut self, responder: R) -> Result<(), R> {
        if self.is_awaiting_sync() {
            return Err(responder);
        }
        self.mode = ReadMode::AwaitingSync {
            accumulator: Vec::new(),
            responder,
        };
        Ok(())
    }

    /// Leave sync mode without completing, returning the discarded responder
    pub fn abandon_sync(&mut self) -> Option<R> {
        match std::mem::replace(&mut self.mode, ReadMode::Stream) {
            ReadMode::AwaitingSync { responder, .. } => Some(responder),
            ReadMode::Stream => None,
        }
    }

    pub fn pending(&self) -> Option<&R> {
        match &self.mode {
            ReadMode::AwaitingSync { responder, .. } => Some(responder),
            ReadMode::Stream => None,
        }
    }

    /// Partial reply gathered so far, if a sync exchange is outstanding
    pub fn accumulated(&self) -> Option<Cow<'_, str>> {
        match &self.mode {
            ReadMode::AwaitingSync { accumulator, .. } => Some(String::from_utf8_lossy(accumulator)),
            ReadMode::Stream => None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Delivery<R> {
        match &mut self.mode {
            ReadMode::AwaitingSync { accumulator, .. } => {
                accumulator.extend_from_slice(chunk);

                // Sentinels are ASCII, so a lossy view finds them even while a
                // multi-byte character is still incomplete.
                let chunk_text = String::from_utf8_lossy(chunk);
                let whole_text = String::from_utf8_lossy(accumulator);
                let done = self.sentinels.completes_sync(&chunk_text) || self.sentinels.completes_sync(&whole_text);
                let diagnostic = self
                    .sentinels
                    .diagnostic_in(&chunk_text)
                    .or_else(|| self.sentinels.diagnostic_in(&whole_text))
                    .map(str::to_string);

                if !done && diagnostic.is_none() {
                    return Delivery::Accumulated;
                }

                match std::mem::replace(&mut self.mode, ReadMode::Stream) {
                    ReadMode::AwaitingSync { accumulator, responder } => Delivery::SyncComplete {
                        responder,
                        response: SyncResponse {
                            text: self.decode(accumulator),
                            diagnostic,
                        },
                    },
                    ReadMode::Stream => Delivery::Accumulated,
                }
            }
            ReadMode::Stream => {
                if chunk.is_empty() {
                    return Delivery::Dropped;
                }
                let text = self.decode(chunk.to_vec());
                Delivery::Streamed(self.sentinels.trim_echo(&text).to_string())
            }
        }
    }

    fn decode(&mut self, bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap_or_else(|e| {
            self.decode_errors += 1;
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        })
    }
}

use serde_json::Value;
use tracing::debug;

use crate::{
    backend::BackendDialect,
    errors::{GatewayError, PROTOCOL_MESSAGE},
    models::{word_tokens, StreamEvent},
};

// Lowercase turn markers that show the engine has started writing the next
// turn itself. A leading `\n` also matches at the start of the output.
pub const TURN_MARKERS: &[&str] = &[
    "<|start_header_id|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_start|>",
    "<|im_end|>",
    "\nuser:",
    "\nhuman:",
    "\n### user",
    "\n### human",
    "\n### instruction",
];

pub fn find_turn_marker(text: &str) -> Option<usize> {
    find_marker_from(text, 0)
}

// Only `text[from..]` is searched; the virtual leading `\n` applies at 0.
fn find_marker_from(text: &str, from: usize) -> Option<usize> {
    let (haystack, pad) = lowered_tail(text, from);
    TURN_MARKERS
        .iter()
        .filter_map(|marker| haystack.find(marker))
        .min()
        .map(|position| from + position.saturating_sub(pad))
}

fn releasable_len(text: &str, from: usize) -> usize {
    let (haystack, pad) = lowered_tail(text, from);
    let bytes = haystack.as_bytes();

    let first = bytes.len().saturating_sub(longest_marker().saturating_sub(1));
    for start in first..bytes.len() {
        let tail = &bytes[start..];
        if TURN_MARKERS
            .iter()
            .any(|marker| marker.len() > tail.len() && marker.as_bytes().starts_with(tail))
        {
            return from + start.saturating_sub(pad);
        }
    }
    text.len()
}

fn lowered_tail(text: &str, from: usize) -> (String, usize) {
    let tail = text[from..].to_ascii_lowercase();
    if from == 0 {
        (format!("\n{tail}"), 1)
    } else {
        (tail, 0)
    }
}

fn longest_marker() -> usize {
    TURN_MARKERS
        .iter()
        .map(|marker| marker.len())
        .max()
        .unwrap_or(0)
}

pub fn scrub_turn_markers(text: &str) -> &str {
    match find_turn_marker(text) {
        Some(cut) => &text[..cut],
        None => text,
    }
}

#[derive(Debug, Default)]
pub struct TurnScrubber {
    text: String,
    emitted: usize,
    truncated: bool,
}

impl TurnScrubber {
    pub fn push(&mut self, piece: &str) -> Option<String> {
        if self.truncated {
            return None;
        }
        self.text.push_str(piece);

        // Released text is marker-free, so only its last few bytes can start one.
        let mut from = self.emitted.saturating_sub(longest_marker());
        while !self.text.is_char_boundary(from) {
            from -= 1;
        }
        let releasable = match find_marker_from(&self.text, from) {
            Some(cut) => {
                self.truncated = true;
                cut
            }
            None => releasable_len(&self.text, from),
        };
        self.release(releasable)
    }

    pub fn flush(&mut self) -> Option<String> {
        if self.truncated {
            return None;
        }
        self.release(self.text.len())
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn emitted(&self) -> &str {
        &self.text[..self.emitted]
    }

    fn release(&mut self, upto: usize) -> Option<String> {
        if upto <= self.emitted {
            return None;
        }
        let released = self.text[self.emitted..upto].to_owned();
        self.emitted = upto;
        Some(released)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFrame {
    Text(String),
    Finished(String),
    Failed(String),
    Skip,
}

pub fn parse_frame(dialect: BackendDialect, line: &str) -> BackendFrame {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return BackendFrame::Skip;
    }
    let payload = match line.strip_prefix("data:") {
        Some(payload) => payload.trim(),
        None if line.starts_with('{') => line,
        // event:, id:, retry: and anything else non-JSON
        None => return BackendFrame::Skip,
    };

    if dialect == BackendDialect::OpenAi && payload == "[DONE]" {
        return BackendFrame::Finished(String::new());
    }

    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        Err(error) => {
            debug!(%dialect, %error, "skipping malformed backend frame");
            return BackendFrame::Skip;
        }
    };

    if let Some(error) = value.get("error") {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("unspecified backend error");
        return BackendFrame::Failed(detail.to_owned());
    }

    match dialect {
        BackendDialect::LlamaCpp => {
            let text = string_at(&value, &["content"]);
            if value.get("stop").and_then(Value::as_bool).unwrap_or(false) {
                BackendFrame::Finished(text)
            } else {
                BackendFrame::Text(text)
            }
        }
        BackendDialect::Ollama => {
            let text = string_at(&value, &["response"]);
            if value.get("done").and_then(Value::as_bool).unwrap_or(false) {
                BackendFrame::Finished(text)
            } else {
                BackendFrame::Text(text)
            }
        }
        BackendDialect::OpenAi => {
            let text = value
                .get("choices")
                .and_then(|choices| choices.get(0))
                .map(|choice| string_at(choice, &["delta", "content"]))
                .unwrap_or_default();
            BackendFrame::Text(text)
        }
    }
}

fn string_at(value: &Value, path: &[&str]) -> String {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(index) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=index).collect::<Vec<_>>();
            match String::from_utf8(line) {
                Ok(line) => lines.push(line),
                Err(error) => debug!(%error, "skipping non-UTF-8 backend line"),
            }
        }
        lines
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        String::from_utf8(std::mem::take(&mut self.pending)).ok()
    }
}

#[derive(Debug)]
pub struct StreamTranslator {
    dialect: BackendDialect,
    lines: LineBuffer,
    scrubber: TurnScrubber,
    finished: bool,
    failure: Option<String>,
}

impl StreamTranslator {
    pub fn new(dialect: BackendDialect) -> Self {
        Self {
            dialect,
            lines: LineBuffer::default(),
            scrubber: TurnScrubber::default(),
            finished: false,
            failure: None,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        for line in self.lines.push(chunk) {
            self.consume_line(&line, &mut events);
            if self.finished {
                break;
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if let Some(line) = self.lines.take_remainder() {
            self.consume_line(&line, &mut events);
        }
        if !self.finished {
            self.fail("backend stream ended without a completion signal", &mut events);
        }
        events
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn emitted_text(&self) -> &str {
        self.scrubber.emitted()
    }

    pub fn completion_tokens(&self) -> u32 {
        word_tokens(self.scrubber.emitted())
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        match parse_frame(self.dialect, line) {
            BackendFrame::Skip => {}
            BackendFrame::Text(text) => self.emit_text(&text, events),
            BackendFrame::Finished(text) => {
                self.emit_text(&text, events);
                if !self.finished {
                    if let Some(rest) = self.scrubber.flush() {
                        events.push(StreamEvent::delta(rest));
                    }
                    self.complete(events);
                }
            }
            BackendFrame::Failed(detail) => self.fail(&detail, events),
        }
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() || self.finished {
            return;
        }
        if let Some(clean) = self.scrubber.push(text) {
            events.push(StreamEvent::delta(clean));
        }
        if self.scrubber.truncated() {
            debug!(dialect = %self.dialect, "turn marker in generated text, ending stream");
            self.complete(events);
        }
    }

    fn complete(&mut self, events: &mut Vec<StreamEvent>) {
        self.finished = true;
        events.push(StreamEvent::Done);
    }

    fn fail(&mut self, detail: &str, events: &mut Vec<StreamEvent>) {
        self.finished = true;
        self.failure = Some(detail.to_owned());
        events.push(StreamEvent::error(PROTOCOL_MESSAGE));
    }
}

pub fn translate_reply(dialect: BackendDialect, reply: &Value) -> Result<String, GatewayError> {
    if let Some(error) = reply.get("error") {
        return Err(GatewayError::BackendProtocol(format!(
            "{dialect} reported an error: {error}"
        )));
    }

    let text = match dialect {
        BackendDialect::LlamaCpp => reply.get("content").and_then(Value::as_str),
        BackendDialect::Ollama => reply.get("response").and_then(Value::as_str),
        BackendDialect::OpenAi => reply
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str),
    }
    .ok_or_else(|| {
        GatewayError::BackendProtocol(format!("{dialect} reply is missing generated text"))
    })?;

    Ok(scrub_turn_markers(text).to_owned())
}

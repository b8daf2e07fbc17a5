//! Incremental token parser for streamed model text.
//!
//! Splits a text-delta stream into literal runs and `<|...|>` control markers.
//! Literal text is buffered until it reaches a minimum length so downstream
//! consumers (speech synthesis, display) are not invoked per token. Markers
//! are emitted as soon as they close.
//!
//! ```
//! use hibiki::chat::parser::{MarkerEvent, MarkerParser};
//!
//! let mut parser = MarkerParser::new(4);
//! let mut events = parser.consume("hi <|wave|> there");
//! events.extend(parser.end());
//! assert_eq!(
//!     events,
//!     vec![
//!         MarkerEvent::Literal("hi ".into()),
//!         MarkerEvent::Special("<|wave|>".into()),
//!         MarkerEvent::Literal(" there".into()),
//!     ]
//! );
//! ```

const MARKER_OPEN: &str = "<|";
const MARKER_CLOSE: &str = "|>";

/// A classified parser output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerEvent {
    /// Plain text to display or speak.
    Literal(String),
    /// A complete control marker, delimiters included.
    Special(String),
}

/// Streaming parser. Create one per turn.
#[derive(Debug)]
pub struct MarkerParser {
    min_literal_len: usize,
    literal: String,
    literal_chars: usize,
    marker: Option<String>,
}

impl MarkerParser {
    /// Create a parser that emits literals once `min_literal_len` characters are buffered.
    pub fn new(min_literal_len: usize) -> Self {
        Self {
            min_literal_len,
            literal: String::new(),
            literal_chars: 0,
            marker: None,
        }
    }

    /// Feed one fragment and return the events it completes.
    pub fn consume(&mut self, fragment: &str) -> Vec<MarkerEvent> {
        let mut events = Vec::new();

        for ch in fragment.chars() {
            if let Some(marker) = self.marker.as_mut() {
                marker.push(ch);
                if marker.len() >= MARKER_OPEN.len() + MARKER_CLOSE.len()
                    && marker.ends_with(MARKER_CLOSE)
                {
                    events.push(MarkerEvent::Special(std::mem::take(marker)));
                    self.marker = None;
                }
                continue;
            }

            self.literal.push(ch);
            self.literal_chars += 1;
            if self.literal.ends_with(MARKER_OPEN) {
                self.literal.truncate(self.literal.len() - MARKER_OPEN.len());
                self.literal_chars -= MARKER_OPEN.chars().count();
                self.take_literal(&mut events);
                self.marker = Some(MARKER_OPEN.to_owned());
            }
        }

        if self.marker.is_none() {
            self.emit_ready_literal(&mut events);
        }
        events
    }

    /// Flush everything still buffered. An unterminated marker is treated as text.
    pub fn end(&mut self) -> Vec<MarkerEvent> {
        let mut events = Vec::new();
        if let Some(marker) = self.marker.take() {
            self.literal_chars += marker.chars().count();
            self.literal.push_str(&marker);
        }
        self.take_literal(&mut events);
        events
    }

    /// Emit the buffered literal if it is long enough, holding back a trailing
    /// `<` that may open a marker in the next fragment.
    fn emit_ready_literal(&mut self, events: &mut Vec<MarkerEvent>) {
        let held_back = usize::from(self.literal.ends_with('<'));
        if self.literal_chars - held_back < self.min_literal_len
            || self.literal_chars == held_back
        {
            return;
        }
        let tail = if held_back == 1 {
            self.literal.pop().map(String::from).unwrap_or_default()
        } else {
            String::new()
        };
        self.literal_chars = held_back;
        let text = std::mem::replace(&mut self.literal, tail);
        events.push(MarkerEvent::Literal(text));
    }

    fn take_literal(&mut self, events: &mut Vec<MarkerEvent>) {
        if self.literal.is_empty() {
            return;
        }
        self.literal_chars = 0;
        events.push(MarkerEvent::Literal(std::mem::take(&mut self.literal)));
    }
}

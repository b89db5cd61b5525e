use chrono::Utc;
use lull_channel::{DonePayload, UsageStats};

use crate::message::{DeliveryKind, FailureKind, MessageId, TranscriptEntry};

/// One run of display text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Plain(String),
    Emphasis(String),
}

impl Segment {
    pub fn text(&self) -> &str {
        match self {
            Self::Plain(text) | Self::Emphasis(text) => text,
        }
    }
}

/// Display form of a message: normalized text split into emphasis runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayText {
    segments: Vec<Segment>,
}

impl DisplayText {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Concatenated text with emphasis markers removed.
    pub fn plain(&self) -> String {
        self.segments.iter().map(Segment::text).collect()
    }

    fn push_plain(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Plain(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Plain(text.to_string()));
        }
    }
}

/// Derives the display form from raw message text.
///
/// Leading newlines are stripped, trailing blanks before a line break are dropped and runs of
/// blank lines collapse to one. `*text*` on a single line becomes an emphasis run; an opening
/// marker without its closer stays literal, so a span split across deltas renders correctly
/// once the closer arrives.
pub fn render_display(raw: &str) -> DisplayText {
    parse_emphasis(&normalize_whitespace(raw))
}

fn normalize_whitespace(raw: &str) -> String {
    let text = raw.trim_start_matches(['\n', '\r']);
    let mut normalized = String::with_capacity(text.len());
    let mut newline_run = 0usize;

    for ch in text.chars() {
        match ch {
            '\r' => continue,
            '\n' => {
                newline_run += 1;
                while normalized.ends_with([' ', '\t']) {
                    normalized.pop();
                }
                if newline_run > 2 {
                    continue;
                }
            }
            _ => newline_run = 0,
        }
        normalized.push(ch);
    }

    normalized
}

fn parse_emphasis(text: &str) -> DisplayText {
    let mut display = DisplayText::default();
    let mut rest = text;

    while let Some(open) = rest.find('*') {
        let after = &rest[open + 1..];
        match emphasis_len(after) {
            Some(len) => {
                display.push_plain(&rest[..open]);
                display
                    .segments
                    .push(Segment::Emphasis(after[..len].to_string()));
                rest = &after[len + 1..];
            }
            None => {
                display.push_plain(&rest[..=open]);
                rest = after;
            }
        }
    }

    display.push_plain(rest);
    display
}

fn emphasis_len(after: &str) -> Option<usize> {
    let first = after.chars().next()?;
    if first.is_whitespace() || first == '*' {
        return None;
    }

    let close = after.find(['*', '\n'])?;
    if !after[close..].starts_with('*') {
        return None;
    }
    if after[..close].ends_with(char::is_whitespace) {
        return None;
    }
    Some(close)
}

/// Lifecycle of a message under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePhase {
    Streaming,
    Finalized,
    Failed(FailureKind),
}

/// A message entity that is still receiving deltas, or the frozen result of one.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMessage {
    id: MessageId,
    kind: DeliveryKind,
    raw: String,
    display: DisplayText,
    phase: LivePhase,
    final_text: Option<String>,
    display_name: Option<String>,
    usage: Option<UsageStats>,
}

impl LiveMessage {
    pub fn new(id: MessageId, kind: DeliveryKind) -> Self {
        Self {
            id,
            kind,
            raw: String::new(),
            display: DisplayText::default(),
            phase: LivePhase::Streaming,
            final_text: None,
            display_name: None,
            usage: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> DeliveryKind {
        self.kind
    }

    /// Locally accumulated preview text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn display(&self) -> &DisplayText {
        &self.display
    }

    pub fn phase(&self) -> LivePhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.phase, LivePhase::Streaming)
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.phase, LivePhase::Finalized)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn usage(&self) -> Option<&UsageStats> {
        self.usage.as_ref()
    }

    /// Appends one delta and recomputes the display form.
    ///
    /// Deltas that arrive after a terminal transition are ignored.
    pub fn apply_delta(&mut self, delta: &str) -> &DisplayText {
        if !self.is_terminal() {
            self.raw.push_str(delta);
            self.display = render_display(&self.raw);
        }
        &self.display
    }

    /// Freezes the message from the authoritative payload, discarding the local preview.
    pub fn finalize(&mut self, done: &DonePayload) -> &DisplayText {
        if self.is_terminal() {
            return &self.display;
        }
        self.display = render_display(&done.message);
        self.final_text = Some(done.message.clone());
        self.display_name = done.display_name.clone();
        self.usage = done.usage.clone();
        self.phase = LivePhase::Finalized;
        &self.display
    }

    /// Replaces the partial text with the failure notice.
    pub fn fail(&mut self, kind: FailureKind) {
        if self.is_terminal() {
            return;
        }
        self.display = DisplayText {
            segments: vec![Segment::Plain(kind.notice().to_string())],
        };
        self.phase = LivePhase::Failed(kind);
    }

    /// Transcript form of a finalized message.
    pub fn to_transcript_entry(&self, fallback_name: &str) -> Option<TranscriptEntry> {
        let text = self.final_text.clone()?;
        Some(TranscriptEntry {
            id: self.id,
            text,
            is_user: false,
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| fallback_name.to_string()),
            timestamp: Utc::now(),
            usage: self.usage.clone(),
        })
    }
}

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::error::ChannelResult;
use super::frame::EventFrame;

/// Blank line between two records.
pub const RECORD_SEPARATOR: &[u8] = b"\n\n";
/// Prefix that marks a payload line inside a record.
pub const DATA_PREFIX: &str = "data:";

const MALFORMED_PREVIEW_CHARS: usize = 120;

/// Counters kept across one decoded stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub malformed: u64,
}

/// Incremental decoder for the record-framed event stream.
///
/// Bytes may arrive split at any position, including inside a UTF-8 sequence or inside the
/// separator itself. Complete records are decoded as soon as their separator arrives and the
/// trailing partial record stays buffered until the next `push`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Bytes before this offset are known not to start a separator.
    scan_from: usize,
    stats: DecoderStats,
}

enum Record {
    Frame(EventFrame),
    Ignored,
    Malformed(String),
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes buffered for a record whose separator has not arrived yet.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends one transport increment and returns every frame it completed, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<EventFrame> {
        // CRLF streams are normalized so the separator search only deals with `\n\n`.
        self.buffer
            .extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.next_separator() {
            let record = self.buffer[..end].to_vec();
            self.buffer.drain(..end + RECORD_SEPARATOR.len());
            self.scan_from = 0;
            if let Some(frame) = self.accept(&record) {
                frames.push(frame);
            }
        }

        self.scan_from = self
            .buffer
            .len()
            .saturating_sub(RECORD_SEPARATOR.len() - 1);
        frames
    }

    /// Flushes a final record that ended without a separator.
    pub fn finish(&mut self) -> Option<EventFrame> {
        let record = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        if record.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        self.accept(&record)
    }

    fn next_separator(&self) -> Option<usize> {
        let start = self.scan_from.min(self.buffer.len());
        self.buffer[start..]
            .windows(RECORD_SEPARATOR.len())
            .position(|window| window == RECORD_SEPARATOR)
            .map(|offset| start + offset)
    }

    fn accept(&mut self, record: &[u8]) -> Option<EventFrame> {
        match decode_record(record) {
            Record::Frame(frame) => {
                self.stats.frames += 1;
                Some(frame)
            }
            Record::Ignored => None,
            Record::Malformed(reason) => {
                self.stats.malformed += 1;
                tracing::warn!(
                    reason = %reason,
                    preview = %preview(record),
                    malformed_total = self.stats.malformed,
                    "dropping malformed stream record"
                );
                None
            }
        }
    }
}

fn decode_record(record: &[u8]) -> Record {
    let Ok(text) = std::str::from_utf8(record) else {
        return Record::Malformed("record is not valid utf-8".to_string());
    };

    let mut data_lines = Vec::new();
    let mut saw_content = false;
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            // Keep-alive comments carry no payload.
            continue;
        }
        saw_content = true;
        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if !saw_content {
        return Record::Ignored;
    }
    if data_lines.is_empty() {
        return Record::Malformed(format!("record has no `{DATA_PREFIX}` line"));
    }

    let payload = data_lines.join("\n");
    match serde_json::from_str::<EventFrame>(&payload) {
        Ok(frame) => Record::Frame(frame),
        Err(error) => Record::Malformed(error.to_string()),
    }
}

fn preview(record: &[u8]) -> String {
    String::from_utf8_lossy(record)
        .chars()
        .take(MALFORMED_PREVIEW_CHARS)
        .collect()
}

struct FrameState<S> {
    source: S,
    decoder: FrameDecoder,
    ready: VecDeque<EventFrame>,
    exhausted: bool,
}

impl<S> FrameState<S> {
    fn finish(&mut self) {
        self.exhausted = true;
        self.ready.extend(self.decoder.finish());
        let stats = self.decoder.stats();
        tracing::debug!(
            frames = stats.frames,
            malformed = stats.malformed,
            "stream transport closed"
        );
    }
}

/// Turns a transport byte stream into a single-pass sequence of frames.
///
/// The sequence ends when the transport ends or fails; a transport failure is logged and
/// otherwise looks like end-of-stream, so callers detect a missing terminal frame the same way
/// in both cases.
pub fn frames<S>(source: S) -> BoxStream<'static, EventFrame>
where
    S: Stream<Item = ChannelResult<Bytes>> + Send + Unpin + 'static,
{
    let state = FrameState {
        source,
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((frame, state));
            }
            if state.exhausted {
                return None;
            }

            match state.source.next().await {
                Some(Ok(bytes)) => {
                    let completed = state.decoder.push(&bytes);
                    state.ready.extend(completed);
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "stream transport failed mid-delivery");
                    state.finish();
                }
                None => state.finish(),
            }
        }
    })
    .boxed()
}

use std::io::{self, Write};
use std::path::PathBuf;

use lull_channel::SessionId;

use crate::message::{DeliveryKind, TranscriptEntry};
use crate::render::{DisplayText, LiveMessage, LivePhase, Segment};
use crate::sink::{DeliveryNotifier, Remediation, TranscriptSink};

const CLEAR_LINE: &str = "\r\x1b[2K";
const ITALIC_ON: &str = "\x1b[3m";
const ITALIC_OFF: &str = "\x1b[23m";
const BELL: &str = "\x07";
const PREVIEW_CHARS: usize = 96;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Afterthoughts(bool),
    Cancel,
    Session(SessionId),
    Quit,
    Help,
    Invalid(String),
}

/// Parses a line; blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let argument = parts.next();
    let command = match (name, argument) {
        ("quit" | "exit", None) => Command::Quit,
        ("cancel", None) => Command::Cancel,
        ("help", None) => Command::Help,
        ("afterthoughts", Some("on")) => Command::Afterthoughts(true),
        ("afterthoughts", Some("off")) => Command::Afterthoughts(false),
        ("session", Some(raw)) => match SessionId::parse(raw) {
            Ok(session_id) => Command::Session(session_id),
            Err(error) => Command::Invalid(error.to_string()),
        },
        _ => Command::Invalid(format!("unknown command `{line}`")),
    };
    Some(command)
}

pub const HELP: &str = "\
commands:
  /afterthoughts on|off   allow or stop unsolicited follow-ups
  /cancel                 stop the reply being streamed
  /session <uuid>         switch to another session
  /quit                   leave";

/// Renders emphasis runs with ANSI italics.
pub fn styled(display: &DisplayText) -> String {
    display
        .segments()
        .iter()
        .map(|segment| match segment {
            Segment::Plain(text) => text.clone(),
            Segment::Emphasis(text) => format!("{ITALIC_ON}{text}{ITALIC_OFF}"),
        })
        .collect()
}

fn preview(display: &DisplayText) -> String {
    let plain = display.plain();
    let last_line = plain.lines().last().unwrap_or_default();
    let skip = last_line.chars().count().saturating_sub(PREVIEW_CHARS);
    last_line.chars().skip(skip).collect()
}

/// Transcript sink that draws on stdout.
///
/// A message under construction occupies one redrawn status line; finalized messages are
/// printed in full. User entries are not echoed since the terminal already shows them.
pub struct TerminalSink {
    assistant_name: String,
    config_path: PathBuf,
}

impl TerminalSink {
    pub fn new(assistant_name: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            assistant_name: assistant_name.into(),
            config_path: config_path.into(),
        }
    }

    fn write(&self, text: &str) {
        write_stdout(text);
    }
}

fn write_stdout(text: &str) {
    write_to(&mut io::stdout().lock(), text);
}

fn write_to(out: &mut impl Write, text: &str) {
    if let Err(error) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        tracing::debug!(error = %error, "failed to write to stdout");
    }
}

impl TranscriptSink for TerminalSink {
    fn append(&self, entry: &TranscriptEntry) {
        if entry.is_user {
            return;
        }
        let display = crate::render::render_display(&entry.text);
        self.write(&format!(
            "{CLEAR_LINE}{}: {}\n",
            entry.display_name,
            styled(&display)
        ));
    }

    fn live_update(&self, message: &LiveMessage) {
        match message.phase() {
            LivePhase::Streaming => {
                let marker = match message.kind() {
                    DeliveryKind::Reply => "…",
                    DeliveryKind::Followup => "~",
                };
                self.write(&format!(
                    "{CLEAR_LINE}{} {marker} {}",
                    self.assistant_name,
                    preview(message.display())
                ));
            }
            LivePhase::Finalized => self.write(CLEAR_LINE),
            LivePhase::Failed(_) => {
                self.write(&format!("{CLEAR_LINE}! {}\n", message.display().plain()));
            }
        }
    }

    fn live_discarded(&self, _id: crate::message::MessageId) {
        self.write(CLEAR_LINE);
    }

    fn remediation(&self, remediation: Remediation) {
        let hint = match remediation {
            Remediation::MissingCredential => format!(
                "set LULL_API_KEY or add \"api_key\" to {}",
                self.config_path.display()
            ),
            Remediation::QuotaExhausted => {
                "the endpoint reports no remaining quota; top up the account and retry".to_string()
            }
        };
        self.write(&format!("  hint: {hint}\n"));
    }
}

/// Rings the terminal bell once per completed delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl DeliveryNotifier for TerminalBell {
    fn delivery_completed(&self, _kind: DeliveryKind) {
        write_stdout(BELL);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::render::render_display;

    #[test]
    fn plain_lines_are_sent() {
        assert_eq!(
            parse_command("  hello there "),
            Some(Command::Send("hello there".to_string()))
        );
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn slash_commands_are_recognized() {
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("/cancel"), Some(Command::Cancel));
        assert_eq!(
            parse_command("/afterthoughts off"),
            Some(Command::Afterthoughts(false))
        );

        let session = "0190a6f2-7c1e-7d3a-9f00-1234567890ab";
        assert_eq!(
            parse_command(&format!("/session {session}")),
            Some(Command::Session(SessionId::parse(session).unwrap()))
        );
    }

    #[test]
    fn malformed_commands_are_reported() {
        assert!(matches!(
            parse_command("/afterthoughts maybe"),
            Some(Command::Invalid(_))
        ));
        assert!(matches!(
            parse_command("/session nope"),
            Some(Command::Invalid(message)) if message.contains("nope")
        ));
    }

    #[test]
    fn emphasis_is_rendered_in_italics() {
        assert_eq!(
            styled(&render_display("so *very* nice")),
            "so \x1b[3mvery\x1b[23m nice"
        );
    }

    #[test]
    fn preview_keeps_the_tail_of_the_last_line() {
        let long = "x".repeat(200);
        let display = render_display(&format!("first\n{long}y"));
        let shown = preview(&display);
        assert_eq!(shown.chars().count(), PREVIEW_CHARS);
        assert!(shown.ends_with('y'));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn output_errors_are_swallowed() {
        let mut written = Vec::new();
        write_to(&mut written, BELL);
        assert_eq!(written, BELL.as_bytes());

        write_to(&mut BrokenPipe, BELL);
    }
}

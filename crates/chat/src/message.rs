use chrono::{DateTime, Utc};
use lull_channel::{FailureCause, UsageStats};

/// Stable identifier for one message within a running client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Which path started a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryKind {
    /// Direct reply to a user-authored message.
    Reply,
    /// Unsolicited follow-up started by the afterthought scheduler.
    Followup,
}

/// The single busy flag shared by user sends and follow-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryState {
    #[default]
    Idle,
    /// User message sent, no frame received yet.
    Sending,
    /// Reply frames are arriving.
    Streaming,
    /// A follow-up is being delivered.
    AfterthoughtStreaming,
}

/// Reason a delivery could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryRejection {
    ReplyInFlight,
    AfterthoughtInFlight,
    EmptyMessage,
}

impl DeliveryState {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns the state a new delivery of `kind` moves to.
    ///
    /// Only `Idle` admits a new delivery; every busy state rejects both kinds.
    pub fn begin(self, kind: DeliveryKind) -> Result<Self, DeliveryRejection> {
        match self {
            Self::Idle => Ok(match kind {
                DeliveryKind::Reply => Self::Sending,
                DeliveryKind::Followup => Self::AfterthoughtStreaming,
            }),
            Self::Sending | Self::Streaming => Err(DeliveryRejection::ReplyInFlight),
            Self::AfterthoughtStreaming => Err(DeliveryRejection::AfterthoughtInFlight),
        }
    }

    /// Applies the first-frame transition; only `Sending` changes.
    pub fn first_frame(self) -> Self {
        match self {
            Self::Sending => Self::Streaming,
            Self::Idle | Self::Streaming | Self::AfterthoughtStreaming => self,
        }
    }
}

/// Terminal failure classification for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Generic,
    /// The stream could not be opened or closed without a terminal frame.
    Connection,
    MissingCredential,
    QuotaExhausted,
    Cancelled,
}

impl FailureKind {
    /// Named conditions that need a dedicated remediation prompt.
    pub fn needs_remediation(self) -> bool {
        matches!(self, Self::MissingCredential | Self::QuotaExhausted)
    }

    pub fn notice(self) -> &'static str {
        match self {
            Self::Generic => "Something went wrong while generating a reply. Please try again.",
            Self::Connection => "The connection dropped before the reply finished.",
            Self::MissingCredential => "No API key is configured. Add one in settings to continue.",
            Self::QuotaExhausted => "The usage quota is exhausted. Check your plan to continue.",
            Self::Cancelled => "Reply cancelled.",
        }
    }
}

impl From<FailureCause> for FailureKind {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::Generic => Self::Generic,
            FailureCause::MissingCredential => Self::MissingCredential,
            FailureCause::QuotaExhausted => Self::QuotaExhausted,
        }
    }
}

/// One finalized message as handed to the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub id: MessageId,
    pub text: String,
    pub is_user: bool,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
    pub usage: Option<UsageStats>,
}

impl TranscriptEntry {
    pub fn user(id: MessageId, text: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            is_user: true,
            display_name: display_name.into(),
            timestamp: Utc::now(),
            usage: None,
        }
    }
}

/// Result of one `send` or follow-up attempt.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(TranscriptEntry),
    Failed(FailureKind),
    Rejected(DeliveryRejection),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }

    pub fn delivered(&self) -> Option<&TranscriptEntry> {
        match self {
            Self::Delivered(entry) => Some(entry),
            Self::Failed(_) | Self::Rejected(_) => None,
        }
    }
}

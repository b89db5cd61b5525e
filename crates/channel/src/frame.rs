use serde::{Deserialize, Serialize};

/// One typed unit of the streamed reply protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventFrame {
    /// Text delta appended to the reply under construction.
    Chunk { content: String },
    /// Authoritative final reply.
    Done(DonePayload),
    /// Terminal failure reported by the server.
    Error(ErrorPayload),
}

impl EventFrame {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    /// Returns true if no further frames belong to this delivery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonePayload {
    pub message: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageStats>,
}

impl DonePayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            display_name: None,
            usage: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_usage(mut self, usage: UsageStats) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Token and cost accounting attached to a finished reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn cause(&self) -> FailureCause {
        FailureCause::from_code(self.code.as_deref())
    }
}

/// Server-side failure classification.
///
/// Only the named conditions get dedicated remediation; every unknown code is `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    Generic,
    MissingCredential,
    QuotaExhausted,
}

impl FailureCause {
    pub fn from_code(code: Option<&str>) -> Self {
        let Some(code) = code else {
            return Self::Generic;
        };

        match code.trim().to_ascii_lowercase().as_str() {
            "missing_api_key" | "no_api_key" | "missing_credential" => Self::MissingCredential,
            "quota_exceeded" | "insufficient_quota" | "quota_exhausted" => Self::QuotaExhausted,
            _ => Self::Generic,
        }
    }

    /// Fallback classification for error responses that carry no code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::MissingCredential,
            402 | 429 => Self::QuotaExhausted,
            _ => Self::Generic,
        }
    }
}

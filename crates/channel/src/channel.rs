use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::error::ChannelResult;
use super::frame::{ErrorPayload, FailureCause};
use super::ids::SessionId;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = BoxStream<'static, ChannelResult<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: SessionId,
    pub message: String,
}

impl ChatRequest {
    pub fn new(session_id: SessionId, message: impl Into<String>) -> Self {
        Self {
            session_id,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterthoughtPhase {
    Decision,
    Followup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfterthoughtRequest {
    pub session_id: SessionId,
    pub elapsed_label: String,
    pub phase: AfterthoughtPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_dialogue: Option<String>,
}

impl AfterthoughtRequest {
    pub fn decision(session_id: SessionId, elapsed_label: impl Into<String>) -> Self {
        Self {
            session_id,
            elapsed_label: elapsed_label.into(),
            phase: AfterthoughtPhase::Decision,
            inner_dialogue: None,
        }
    }

    pub fn followup(
        session_id: SessionId,
        elapsed_label: impl Into<String>,
        inner_dialogue: Option<String>,
    ) -> Self {
        Self {
            session_id,
            elapsed_label: elapsed_label.into(),
            phase: AfterthoughtPhase::Followup,
            inner_dialogue,
        }
    }
}

/// One logical streamed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRequest {
    Reply(ChatRequest),
    Followup(AfterthoughtRequest),
}

impl DeliveryRequest {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Reply(request) => request.session_id,
            Self::Followup(request) => request.session_id,
        }
    }
}

/// Answer from the decision phase of the afterthought endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: bool,
    #[serde(default)]
    pub inner_dialogue: Option<String>,
}

impl Decision {
    pub fn granted(inner_dialogue: Option<String>) -> Self {
        Self {
            decision: true,
            inner_dialogue,
        }
    }

    pub fn declined() -> Self {
        Self::default()
    }
}

/// Non-streaming error answer received instead of an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedResponse {
    pub status: Option<u16>,
    pub body: ErrorPayload,
}

impl RejectedResponse {
    pub fn new(status: Option<u16>, body: ErrorPayload) -> Self {
        Self { status, body }
    }

    /// An explicit error code wins over the status-based fallback.
    pub fn cause(&self) -> FailureCause {
        match (self.body.cause(), self.status) {
            (FailureCause::Generic, Some(status)) if self.body.code.is_none() => {
                FailureCause::from_status(status)
            }
            (cause, _) => cause,
        }
    }
}

pub enum ChannelResponse {
    Stream(ByteStream),
    Rejected(RejectedResponse),
}

impl fmt::Debug for ChannelResponse {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(_) => formatter.write_str("ChannelResponse::Stream(..)"),
            Self::Rejected(rejected) => formatter
                .debug_tuple("ChannelResponse::Rejected")
                .field(rejected)
                .finish(),
        }
    }
}

/// Opens streamed deliveries.
pub trait DeliveryChannel: Send + Sync {
    fn open<'a>(&'a self, request: DeliveryRequest) -> BoxFuture<'a, ChannelResult<ChannelResponse>>;
}

/// Asks whether an unsolicited follow-up should be delivered.
pub trait DecisionEndpoint: Send + Sync {
    fn decide<'a>(&'a self, request: AfterthoughtRequest) -> BoxFuture<'a, ChannelResult<Decision>>;
}

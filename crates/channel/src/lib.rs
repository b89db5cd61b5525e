#![deny(unsafe_code)]

//! Wire side of message delivery: the framed event protocol, its incremental decoder and the
//! channel seams the chat core talks to.

pub mod channel;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod http;
pub mod ids;

pub use channel::{
    AfterthoughtPhase, AfterthoughtRequest, BoxFuture, ByteStream, ChannelResponse, ChatRequest,
    Decision, DecisionEndpoint, DeliveryChannel, DeliveryRequest, RejectedResponse,
};
pub use decoder::{DATA_PREFIX, DecoderStats, FrameDecoder, RECORD_SEPARATOR, frames};
pub use error::{ChannelError, ChannelResult};
pub use frame::{DonePayload, ErrorPayload, EventFrame, FailureCause, UsageStats};
pub use http::{AFTERTHOUGHT_PATH, CHAT_PATH, HttpChannel, HttpConfig};
pub use ids::SessionId;

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use snafu::ResultExt;

use super::channel::{
    AfterthoughtRequest, BoxFuture, ChannelResponse, DecisionEndpoint, DeliveryChannel,
    DeliveryRequest, Decision, RejectedResponse,
};
use super::error::{
    BuildClientSnafu, ChannelResult, DecodeBodySnafu, ReadBodySnafu, SendRequestSnafu,
    StatusSnafu, TransportSnafu,
};
use super::frame::ErrorPayload;

pub const CHAT_PATH: &str = "/api/chat";
pub const AFTERTHOUGHT_PATH: &str = "/api/afterthought";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    /// Bounds decision requests only; streamed bodies stay open as long as the server writes.
    pub decision_timeout: Duration,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            api_key: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }
}

/// HTTP implementation of both the delivery channel and the decision endpoint.
pub struct HttpChannel {
    client: Client,
    config: HttpConfig,
}

impl HttpChannel {
    pub fn new(config: HttpConfig) -> ChannelResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> RequestBuilder {
        let builder = self.client.post(url).json(body);
        match &self.config.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    async fn open_stream(&self, request: DeliveryRequest) -> ChannelResult<ChannelResponse> {
        let session_id = request.session_id();
        let (url, builder) = match &request {
            DeliveryRequest::Reply(body) => {
                let url = self.url(CHAT_PATH);
                let builder = self.post(&url, body);
                (url, builder)
            }
            DeliveryRequest::Followup(body) => {
                let url = self.url(AFTERTHOUGHT_PATH);
                let builder = self.post(&url, body);
                (url, builder)
            }
        };

        tracing::debug!(session_id = %session_id, url = %url, "opening delivery stream");
        let response = builder
            .header(ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "open-delivery-stream",
                url,
            })?;

        Self::classify_response(response).await
    }

    async fn classify_response(response: Response) -> ChannelResult<ChannelResponse> {
        let status = response.status();

        // The content kind decides the decoding path, before the status does.
        if is_json(&response) {
            let body = response.text().await.context(ReadBodySnafu {
                stage: "read-json-error-body",
            })?;
            let payload = serde_json::from_str::<ErrorPayload>(&body)
                .unwrap_or_else(|_| ErrorPayload::new(body));
            tracing::warn!(
                status = status.as_u16(),
                code = ?payload.code,
                error = %payload.error,
                "delivery rejected with a json error body"
            );
            return Ok(ChannelResponse::Rejected(RejectedResponse::new(
                Some(status.as_u16()),
                payload,
            )));
        }

        if !status.is_success() {
            let body = response.text().await.context(ReadBodySnafu {
                stage: "read-status-error-body",
            })?;
            tracing::warn!(status = status.as_u16(), "delivery rejected by status");
            return Ok(ChannelResponse::Rejected(RejectedResponse::new(
                Some(status.as_u16()),
                ErrorPayload::new(body),
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|item| {
                item.context(TransportSnafu {
                    stage: "read-stream-chunk",
                })
            })
            .boxed();
        Ok(ChannelResponse::Stream(stream))
    }

    async fn request_decision(&self, request: AfterthoughtRequest) -> ChannelResult<Decision> {
        let url = self.url(AFTERTHOUGHT_PATH);
        let response = self
            .post(&url, &request)
            .timeout(self.config.decision_timeout)
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "send-decision-request",
                url,
            })?;

        let status = response.status();
        let body = response.text().await.context(ReadBodySnafu {
            stage: "read-decision-body",
        })?;

        if !status.is_success() {
            return StatusSnafu {
                stage: "decision-http-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        serde_json::from_str(&body).context(DecodeBodySnafu {
            stage: "decode-decision-body",
        })
    }
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        })
}

impl DeliveryChannel for HttpChannel {
    fn open<'a>(&'a self, request: DeliveryRequest) -> BoxFuture<'a, ChannelResult<ChannelResponse>> {
        Box::pin(self.open_stream(request))
    }
}

impl DecisionEndpoint for HttpChannel {
    fn decide<'a>(&'a self, request: AfterthoughtRequest) -> BoxFuture<'a, ChannelResult<Decision>> {
        Box::pin(self.request_decision(request))
    }
}

use futures::StreamExt;
use lull_channel::{
    AfterthoughtRequest, ChannelError, ChannelResponse, ChatRequest, DecisionEndpoint,
    DeliveryChannel, DeliveryRequest, DonePayload, EventFrame, FailureCause, HttpChannel,
    HttpConfig, SessionId, frames,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION: &str = "0190a6f2-7c1e-7d3a-9f00-1234567890ab";

fn session_id() -> SessionId {
    SessionId::parse(SESSION).unwrap()
}

fn channel(server: &MockServer) -> HttpChannel {
    HttpChannel::new(HttpConfig::new(server.uri()).with_api_key("secret")).unwrap()
}

#[tokio::test]
async fn reply_stream_is_decoded_into_frames() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"type\":\"chunk\",\"content\":\"Hi\"}\n\n",
        "data: {\"type\":\"chunk\",\"content\":\" there\"}\n\n",
        "data: {\"type\":\"done\",\"message\":\"Hi there\",\"display_name\":\"Ada\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({ "session_id": SESSION, "message": "hello" })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let response = channel(&server)
        .open(DeliveryRequest::Reply(ChatRequest::new(session_id(), "hello")))
        .await
        .unwrap();
    let bytes = match response {
        ChannelResponse::Stream(bytes) => bytes,
        other => panic!("expected a stream, got {other:?}"),
    };

    let collected = frames(bytes).collect::<Vec<_>>().await;
    assert_eq!(
        collected,
        vec![
            EventFrame::chunk("Hi"),
            EventFrame::chunk(" there"),
            EventFrame::Done(DonePayload::new("Hi there").with_display_name("Ada")),
        ]
    );
}

#[tokio::test]
async fn json_error_body_is_classified_without_decoding_a_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": "You are out of credits",
            "code": "quota_exceeded",
        })))
        .mount(&server)
        .await;

    let response = channel(&server)
        .open(DeliveryRequest::Reply(ChatRequest::new(session_id(), "hello")))
        .await
        .unwrap();
    let rejected = match response {
        ChannelResponse::Rejected(rejected) => rejected,
        other => panic!("expected a rejection, got {other:?}"),
    };
    assert_eq!(rejected.status, Some(402));
    assert_eq!(rejected.cause(), FailureCause::QuotaExhausted);
}

#[tokio::test]
async fn plain_server_error_is_a_generic_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/afterthought"))
        .respond_with(ResponseTemplate::new(500).set_body_raw("upstream died", "text/plain"))
        .mount(&server)
        .await;

    let request = AfterthoughtRequest::followup(session_id(), "1 minute", None);
    let response = channel(&server)
        .open(DeliveryRequest::Followup(request))
        .await
        .unwrap();
    let rejected = match response {
        ChannelResponse::Rejected(rejected) => rejected,
        other => panic!("expected a rejection, got {other:?}"),
    };
    assert_eq!(rejected.body.error, "upstream died");
    assert_eq!(rejected.cause(), FailureCause::Generic);
}

#[tokio::test]
async fn decision_phase_returns_inner_dialogue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/afterthought"))
        .and(body_partial_json(json!({
            "session_id": SESSION,
            "elapsed_label": "5 minutes",
            "phase": "decision",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "decision": true,
            "inner_dialogue": "they went quiet after the joke",
        })))
        .mount(&server)
        .await;

    let decision = channel(&server)
        .decide(AfterthoughtRequest::decision(session_id(), "5 minutes"))
        .await
        .unwrap();
    assert!(decision.decision);
    assert_eq!(
        decision.inner_dialogue.as_deref(),
        Some("they went quiet after the joke")
    );
}

#[tokio::test]
async fn decision_failure_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/afterthought"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let error = channel(&server)
        .decide(AfterthoughtRequest::decision(session_id(), "10 seconds"))
        .await
        .unwrap_err();
    assert!(matches!(error, ChannelError::Status { status: 503, .. }));
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use lull::{
    DeliveryKind, DeliveryNotifier, LiveMessage, ManualClock, MessageId, Messenger,
    MessengerBuilder, Remediation, TranscriptEntry, TranscriptSink,
};
use lull_channel::{
    AfterthoughtRequest, BoxFuture, ChannelError, ChannelResponse, ChannelResult, Decision,
    DecisionEndpoint, DeliveryChannel, DeliveryRequest, ErrorPayload, RejectedResponse, SessionId,
};
use serde_json::json;
use tokio::sync::mpsc;

pub const SESSION: &str = "0190a6f2-7c1e-7d3a-9f00-1234567890ab";
pub const OTHER_SESSION: &str = "0190a6f2-7c1e-7d3a-9f00-ba0987654321";

pub fn session_id() -> SessionId {
    SessionId::parse(SESSION).unwrap()
}

pub fn chunk(content: &str) -> String {
    record(json!({ "type": "chunk", "content": content }))
}

pub fn done(message: &str) -> String {
    record(json!({ "type": "done", "message": message, "display_name": "Ada" }))
}

pub fn error(message: &str, code: Option<&str>) -> String {
    record(json!({ "type": "error", "error": message, "code": code }))
}

fn record(payload: serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

/// Scripted answer for one `open` call.
pub enum Script {
    /// Body delivered as the given transport pieces, then closed.
    Body(Vec<String>),
    /// Body pieces pushed by the test through the returned sender.
    Gated(mpsc::UnboundedReceiver<Bytes>),
    Rejected(RejectedResponse),
    Unreachable,
}

impl Script {
    pub fn frames(records: &[String]) -> Self {
        Self::Body(records.to_vec())
    }

    pub fn gated() -> (Self, mpsc::UnboundedSender<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::Gated(receiver), sender)
    }

    pub fn rejected(status: u16, code: &str) -> Self {
        Self::Rejected(RejectedResponse::new(
            Some(status),
            ErrorPayload::new("rejected").with_code(code),
        ))
    }
}

fn unavailable(details: &str) -> ChannelError {
    ChannelError::Unavailable {
        stage: "scripted",
        details: details.to_string(),
    }
}

#[derive(Default)]
pub struct ScriptedChannel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<DeliveryRequest>>,
}

impl ScriptedChannel {
    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl DeliveryChannel for ScriptedChannel {
    fn open<'a>(
        &'a self,
        request: DeliveryRequest,
    ) -> BoxFuture<'a, ChannelResult<ChannelResponse>> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();
        Box::pin(async move {
            match script {
                Some(Script::Body(pieces)) => {
                    let pieces = pieces
                        .into_iter()
                        .map(|piece| Ok::<_, ChannelError>(Bytes::from(piece)))
                        .collect::<Vec<_>>();
                    Ok(ChannelResponse::Stream(stream::iter(pieces).boxed()))
                }
                Some(Script::Gated(receiver)) => {
                    let body = stream::unfold(receiver, |mut receiver| async move {
                        receiver
                            .recv()
                            .await
                            .map(|bytes| (Ok::<_, ChannelError>(bytes), receiver))
                    });
                    Ok(ChannelResponse::Stream(body.boxed()))
                }
                Some(Script::Rejected(rejected)) => Ok(ChannelResponse::Rejected(rejected)),
                Some(Script::Unreachable) => Err(unavailable("connection refused")),
                None => Err(unavailable("no scripted response left")),
            }
        })
    }
}

/// Decision endpoint answering from a queue, declining once it runs dry.
#[derive(Default)]
pub struct ScriptedDecisions {
    answers: Mutex<VecDeque<ChannelResult<Decision>>>,
    requests: Mutex<Vec<AfterthoughtRequest>>,
}

impl ScriptedDecisions {
    pub fn grant(&self, inner_dialogue: &str) {
        self.push(Ok(Decision::granted(Some(inner_dialogue.to_string()))));
    }

    pub fn fail(&self) {
        self.push(Err(unavailable("decision endpoint down")));
    }

    pub fn push(&self, answer: ChannelResult<Decision>) {
        self.answers.lock().unwrap().push_back(answer);
    }

    pub fn requests(&self) -> Vec<AfterthoughtRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.elapsed_label)
            .collect()
    }
}

impl DecisionEndpoint for ScriptedDecisions {
    fn decide<'a>(&'a self, request: AfterthoughtRequest) -> BoxFuture<'a, ChannelResult<Decision>> {
        self.requests.lock().unwrap().push(request);
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Decision::declined()));
        Box::pin(async move { answer })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub entries: Mutex<Vec<TranscriptEntry>>,
    pub updates: Mutex<Vec<LiveMessage>>,
    pub discarded: Mutex<Vec<MessageId>>,
    pub remediations: Mutex<Vec<Remediation>>,
}

impl RecordingSink {
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.entries().into_iter().map(|entry| entry.text).collect()
    }

    pub fn last_update(&self) -> Option<LiveMessage> {
        self.updates.lock().unwrap().last().cloned()
    }

    pub fn discarded(&self) -> Vec<MessageId> {
        self.discarded.lock().unwrap().clone()
    }

    pub fn remediations(&self) -> Vec<Remediation> {
        self.remediations.lock().unwrap().clone()
    }
}

impl TranscriptSink for RecordingSink {
    fn append(&self, entry: &TranscriptEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }

    fn live_update(&self, message: &LiveMessage) {
        self.updates.lock().unwrap().push(message.clone());
    }

    fn live_discarded(&self, id: MessageId) {
        self.discarded.lock().unwrap().push(id);
    }

    fn remediation(&self, remediation: Remediation) {
        self.remediations.lock().unwrap().push(remediation);
    }
}

#[derive(Default)]
pub struct CountingNotifier {
    completed: Mutex<Vec<DeliveryKind>>,
    count: AtomicUsize,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<DeliveryKind> {
        self.completed.lock().unwrap().clone()
    }
}

impl DeliveryNotifier for CountingNotifier {
    fn delivery_completed(&self, kind: DeliveryKind) {
        self.completed.lock().unwrap().push(kind);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A messenger wired to fakes and a manual clock.
pub struct Harness {
    pub messenger: Messenger,
    pub channel: Arc<ScriptedChannel>,
    pub decisions: Arc<ScriptedDecisions>,
    pub sink: Arc<RecordingSink>,
    pub notifier: Arc<CountingNotifier>,
    pub clock: Arc<ManualClock>,
    pub enabled: Arc<AtomicBool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    pub fn with(configure: impl FnOnce(MessengerBuilder) -> MessengerBuilder) -> Self {
        let channel = Arc::new(ScriptedChannel::default());
        let decisions = Arc::new(ScriptedDecisions::default());
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let clock = Arc::new(ManualClock::new());
        let enabled = Arc::new(AtomicBool::new(true));

        let builder = MessengerBuilder::new(
            session_id(),
            channel.clone(),
            decisions.clone(),
            sink.clone(),
        )
        .clock(clock.clone())
        .notifier(notifier.clone())
        .toggle(enabled.clone());
        let messenger = configure(builder).build();

        Self {
            messenger,
            channel,
            decisions,
            sink,
            notifier,
            clock,
            enabled,
        }
    }

    /// Completes one ordinary exchange so the scheduler is armed at the bottom of the ladder.
    pub async fn exchange(&self, text: &str, reply: &str) {
        self.channel
            .push(Script::frames(&[chunk(reply), done(reply)]));
        let outcome = self.messenger.send(text).await;
        assert!(outcome.is_delivered(), "exchange failed: {outcome:?}");
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

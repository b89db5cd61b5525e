use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::StreamExt;
use lull_channel::{
    AfterthoughtRequest, ChannelResponse, ChatRequest, DecisionEndpoint, DeliveryChannel,
    DeliveryRequest, EventFrame, SessionId, frames,
};
use tokio_util::sync::CancellationToken;

use crate::afterthought::{
    AfterthoughtScheduler, AfterthoughtTimerState, ArmOrigin, DecisionOutcome, DecisionVerdict,
    FOLLOWUP_RESUME_STAGE, Ladder, SchedulerPhase, TimerVerdict, elapsed_label,
};
use crate::clock::{ActivityClock, TimerCallback, TimerHandle, TokioClock};
use crate::message::{
    DeliveryKind, DeliveryOutcome, DeliveryRejection, DeliveryState, FailureKind, MessageId,
    TranscriptEntry,
};
use crate::render::LiveMessage;
use crate::settings::{DEFAULT_ASSISTANT_DISPLAY_NAME, DEFAULT_USER_DISPLAY_NAME, Settings};
use crate::sink::{
    AfterthoughtToggle, DeliveryNotifier, Remediation, SilentNotifier, TranscriptSink,
};

/// Assembles a [`Messenger`] from its collaborators.
pub struct MessengerBuilder {
    session_id: SessionId,
    channel: Arc<dyn DeliveryChannel>,
    decisions: Arc<dyn DecisionEndpoint>,
    sink: Arc<dyn TranscriptSink>,
    clock: Option<Arc<dyn ActivityClock>>,
    notifier: Arc<dyn DeliveryNotifier>,
    toggle: Arc<dyn AfterthoughtToggle>,
    ladder: Ladder,
    resume_stage: usize,
    initial_message_count: u64,
    user_display_name: String,
    assistant_display_name: String,
}

impl MessengerBuilder {
    pub fn new(
        session_id: SessionId,
        channel: Arc<dyn DeliveryChannel>,
        decisions: Arc<dyn DecisionEndpoint>,
        sink: Arc<dyn TranscriptSink>,
    ) -> Self {
        Self {
            session_id,
            channel,
            decisions,
            sink,
            clock: None,
            notifier: Arc::new(SilentNotifier),
            toggle: Arc::new(AtomicBool::new(true)),
            ladder: Ladder::default(),
            resume_stage: FOLLOWUP_RESUME_STAGE,
            initial_message_count: 0,
            user_display_name: DEFAULT_USER_DISPLAY_NAME.to_string(),
            assistant_display_name: DEFAULT_ASSISTANT_DISPLAY_NAME.to_string(),
        }
    }

    /// Applies ladder and display names from loaded settings.
    pub fn settings(self, settings: &Settings) -> Self {
        self.ladder(settings.afterthought.ladder())
            .resume_stage(settings.afterthought.resume_stage)
            .user_display_name(settings.user_display_name.clone())
            .assistant_display_name(settings.assistant_display_name.clone())
    }

    pub fn clock(mut self, clock: Arc<dyn ActivityClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn DeliveryNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn toggle(mut self, toggle: Arc<dyn AfterthoughtToggle>) -> Self {
        self.toggle = toggle;
        self
    }

    pub fn ladder(mut self, ladder: Ladder) -> Self {
        self.ladder = ladder;
        self
    }

    pub fn resume_stage(mut self, stage: usize) -> Self {
        self.resume_stage = stage;
        self
    }

    /// Seeds the message total with the length of the server-owned transcript.
    pub fn initial_message_count(mut self, count: u64) -> Self {
        self.initial_message_count = count;
        self
    }

    pub fn user_display_name(mut self, name: impl Into<String>) -> Self {
        self.user_display_name = name.into();
        self
    }

    pub fn assistant_display_name(mut self, name: impl Into<String>) -> Self {
        self.assistant_display_name = name.into();
        self
    }

    pub fn build(self) -> Messenger {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(TokioClock::new()) as Arc<dyn ActivityClock>);
        let state = CoreState {
            session_id: self.session_id,
            delivery: DeliveryState::Idle,
            serial: 0,
            active_token: None,
            scheduler: AfterthoughtScheduler::new(self.ladder, self.resume_stage),
            pending_timer: None,
            total_messages: self.initial_message_count,
            next_message_id: 1,
        };

        Messenger {
            inner: Arc::new(Inner {
                channel: self.channel,
                decisions: self.decisions,
                sink: self.sink,
                clock,
                notifier: self.notifier,
                toggle: self.toggle,
                user_display_name: self.user_display_name,
                assistant_display_name: self.assistant_display_name,
                state: Mutex::new(state),
            }),
        }
    }
}

/// Drives user sends and unsolicited follow-ups for one session at a time.
///
/// All deliveries share one [`DeliveryState`]; it is checked and set under a single lock
/// acquisition, and the lock is never held across an await. The afterthought scheduler is
/// re-armed by delivery completion and disarmed whenever a new delivery begins.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    /// Sends a user-authored message and streams the reply to completion.
    pub async fn send(&self, text: impl Into<String>) -> DeliveryOutcome {
        let text = text.into();
        if text.trim().is_empty() {
            return DeliveryOutcome::Rejected(DeliveryRejection::EmptyMessage);
        }

        let delivery = {
            let mut state = self.inner.lock_state();
            let delivery = match state.begin(DeliveryKind::Reply) {
                Ok(delivery) => delivery,
                Err(rejection) => {
                    tracing::debug!(rejection = ?rejection, "send rejected");
                    return DeliveryOutcome::Rejected(rejection);
                }
            };
            self.inner.disarm_locked(&mut state);
            delivery
        };

        if let Some(user_message_id) = delivery.user_message_id {
            let entry = TranscriptEntry::user(
                user_message_id,
                text.as_str(),
                self.inner.user_display_name.as_str(),
            );
            self.inner.sink.append(&entry);
        }

        let _guard = DeliveryGuard::new(&self.inner, delivery.serial);
        let request = DeliveryRequest::Reply(ChatRequest::new(delivery.session_id, text));
        let streamed = self.inner.stream_delivery(request, &delivery).await;
        self.inner.finish(&delivery, streamed)
    }

    /// Streams an unsolicited follow-up. Normally entered by the afterthought scheduler.
    pub async fn deliver_followup(&self, inner_dialogue: Option<String>) -> DeliveryOutcome {
        let start = {
            let mut state = self.inner.lock_state();
            match self.inner.begin_followup_locked(&mut state, inner_dialogue) {
                Ok(start) => start,
                Err(rejection) => {
                    tracing::debug!(rejection = ?rejection, "follow-up rejected");
                    return DeliveryOutcome::Rejected(rejection);
                }
            }
        };
        self.inner.run_followup(start).await
    }

    /// Aborts the in-flight delivery, if any. Returns false when there was nothing to cancel.
    pub fn cancel_delivery(&self) -> bool {
        let state = self.inner.lock_state();
        match state.active_token.as_ref() {
            Some(token) => {
                token.cancel();
                tracing::info!(session_id = %state.session_id, "delivery cancelled");
                true
            }
            None => false,
        }
    }

    /// Retargets the messenger at another session, dropping everything tied to the old one.
    pub fn switch_session(&self, session_id: SessionId) {
        let mut state = self.inner.lock_state();
        if let Some(token) = state.active_token.take() {
            token.cancel();
        }
        self.inner.disarm_locked(&mut state);
        tracing::info!(from = %state.session_id, to = %session_id, "switched session");
        state.session_id = session_id;
        state.total_messages = 0;
    }

    pub fn set_message_count(&self, count: u64) {
        self.inner.lock_state().total_messages = count;
    }

    /// Disarms the scheduler, e.g. after the feature was switched off.
    pub fn disarm_afterthoughts(&self) {
        let mut state = self.inner.lock_state();
        self.inner.disarm_locked(&mut state);
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.lock_state();
        if let Some(token) = state.active_token.as_ref() {
            token.cancel();
        }
        self.inner.disarm_locked(&mut state);
        tracing::debug!(session_id = %state.session_id, "messenger shut down");
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.inner.lock_state().delivery
    }

    pub fn afterthought_state(&self) -> AfterthoughtTimerState {
        self.inner.lock_state().scheduler.snapshot()
    }

    pub fn scheduler_phase(&self) -> SchedulerPhase {
        self.inner.lock_state().scheduler.phase()
    }

    pub fn message_count(&self) -> u64 {
        self.inner.lock_state().total_messages
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.lock_state().session_id
    }
}

struct Inner {
    channel: Arc<dyn DeliveryChannel>,
    decisions: Arc<dyn DecisionEndpoint>,
    sink: Arc<dyn TranscriptSink>,
    clock: Arc<dyn ActivityClock>,
    notifier: Arc<dyn DeliveryNotifier>,
    toggle: Arc<dyn AfterthoughtToggle>,
    user_display_name: String,
    assistant_display_name: String,
    state: Mutex<CoreState>,
}

struct CoreState {
    session_id: SessionId,
    delivery: DeliveryState,
    serial: u64,
    active_token: Option<CancellationToken>,
    scheduler: AfterthoughtScheduler,
    pending_timer: Option<TimerHandle>,
    total_messages: u64,
    next_message_id: u64,
}

impl CoreState {
    fn begin(&mut self, kind: DeliveryKind) -> Result<Delivery, DeliveryRejection> {
        self.delivery = self.delivery.begin(kind)?;
        self.serial += 1;
        let token = CancellationToken::new();
        self.active_token = Some(token.clone());

        let user_message_id = (kind == DeliveryKind::Reply).then(|| self.allocate_id());
        Ok(Delivery {
            serial: self.serial,
            kind,
            session_id: self.session_id,
            user_message_id,
            message_id: self.allocate_id(),
            token,
        })
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    fn owns(&self, serial: u64) -> bool {
        self.serial == serial && !self.delivery.is_idle()
    }

    fn release(&mut self, serial: u64) -> bool {
        if !self.owns(serial) {
            return false;
        }
        self.delivery = DeliveryState::Idle;
        self.active_token = None;
        true
    }
}

/// One started delivery.
struct Delivery {
    serial: u64,
    kind: DeliveryKind,
    session_id: SessionId,
    user_message_id: Option<MessageId>,
    message_id: MessageId,
    token: CancellationToken,
}

struct FollowupStart {
    delivery: Delivery,
    request: AfterthoughtRequest,
}

enum Streamed {
    Finalized(LiveMessage),
    Failed {
        live: Option<LiveMessage>,
        kind: FailureKind,
    },
}

/// Returns the delivery state to idle if the owning future is dropped before it finishes.
struct DeliveryGuard<'a> {
    inner: &'a Inner,
    serial: u64,
}

impl<'a> DeliveryGuard<'a> {
    fn new(inner: &'a Inner, serial: u64) -> Self {
        Self { inner, serial }
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if state.release(self.serial) {
            tracing::debug!(serial = self.serial, "delivery dropped before completion");
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disarm_locked(&self, state: &mut CoreState) {
        state.scheduler.disarm();
        if let Some(handle) = state.pending_timer.take() {
            self.clock.cancel(&handle);
        }
    }

    fn arm_locked(self: &Arc<Self>, state: &mut CoreState, origin: ArmOrigin) {
        if let Some(handle) = state.pending_timer.take() {
            self.clock.cancel(&handle);
        }
        let enabled = self.toggle.afterthoughts_enabled();
        match state.scheduler.arm(origin, enabled, Instant::now()) {
            Some(arming) => {
                tracing::debug!(
                    session_id = %state.session_id,
                    stage = arming.stage,
                    delay_secs = arming.delay.as_secs(),
                    "afterthought armed"
                );
                self.schedule_locked(state, arming.epoch, arming.delay);
            }
            None => {
                tracing::debug!(enabled, phase = ?state.scheduler.phase(), "afterthought not armed");
            }
        }
    }

    fn schedule_locked(self: &Arc<Self>, state: &mut CoreState, epoch: u64, delay: Duration) {
        let handle = self
            .clock
            .schedule(delay, timer_fired(Arc::downgrade(self), epoch));
        state.pending_timer = Some(handle);
    }

    fn begin_followup_locked(
        &self,
        state: &mut CoreState,
        inner_dialogue: Option<String>,
    ) -> Result<FollowupStart, DeliveryRejection> {
        let delivery = state.begin(DeliveryKind::Followup)?;
        self.disarm_locked(state);
        let label = state
            .scheduler
            .last_elapsed_label()
            .map(str::to_string)
            .unwrap_or_else(|| elapsed_label(Duration::ZERO));
        let request = AfterthoughtRequest::followup(delivery.session_id, label, inner_dialogue);
        Ok(FollowupStart { delivery, request })
    }

    async fn run_followup(self: &Arc<Self>, start: FollowupStart) -> DeliveryOutcome {
        let FollowupStart { delivery, request } = start;
        let _guard = DeliveryGuard::new(self, delivery.serial);
        let streamed = self
            .stream_delivery(DeliveryRequest::Followup(request), &delivery)
            .await;
        self.finish(&delivery, streamed)
    }

    fn mark_streaming(&self, serial: u64) {
        let mut state = self.lock_state();
        if state.serial == serial {
            state.delivery = state.delivery.first_frame();
        }
    }

    async fn stream_delivery(&self, request: DeliveryRequest, delivery: &Delivery) -> Streamed {
        let token = &delivery.token;
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Streamed::Failed { live: None, kind: FailureKind::Cancelled };
            }
            opened = self.channel.open(request) => opened,
        };

        let bytes = match opened {
            Ok(ChannelResponse::Stream(bytes)) => bytes,
            Ok(ChannelResponse::Rejected(rejected)) => {
                let kind = FailureKind::from(rejected.cause());
                tracing::warn!(
                    session_id = %delivery.session_id,
                    status = ?rejected.status,
                    code = ?rejected.body.code,
                    error = %rejected.body.error,
                    "delivery rejected before streaming"
                );
                return Streamed::Failed { live: None, kind };
            }
            Err(error) => {
                tracing::error!(
                    session_id = %delivery.session_id,
                    kind = ?delivery.kind,
                    error = %error,
                    "failed to open delivery stream"
                );
                return Streamed::Failed {
                    live: None,
                    kind: FailureKind::Connection,
                };
            }
        };

        let mut frames = frames(bytes);
        let mut live = LiveMessage::new(delivery.message_id, delivery.kind);
        self.sink.live_update(&live);
        let mut first_frame = true;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = frames.next() => Some(next),
            };
            let Some(next) = next else {
                live.fail(FailureKind::Cancelled);
                return Streamed::Failed {
                    live: Some(live),
                    kind: FailureKind::Cancelled,
                };
            };
            let Some(frame) = next else {
                tracing::warn!(
                    session_id = %delivery.session_id,
                    kind = ?delivery.kind,
                    "stream closed without a terminal frame"
                );
                live.fail(FailureKind::Connection);
                return Streamed::Failed {
                    live: Some(live),
                    kind: FailureKind::Connection,
                };
            };

            if first_frame {
                first_frame = false;
                self.mark_streaming(delivery.serial);
            }

            match frame {
                EventFrame::Chunk { content } => {
                    live.apply_delta(&content);
                    self.sink.live_update(&live);
                }
                EventFrame::Done(done) => {
                    live.finalize(&done);
                    return Streamed::Finalized(live);
                }
                EventFrame::Error(payload) => {
                    let kind = FailureKind::from(payload.cause());
                    tracing::warn!(
                        session_id = %delivery.session_id,
                        kind = ?delivery.kind,
                        code = ?payload.code,
                        error = %payload.error,
                        "delivery failed mid-stream"
                    );
                    live.fail(kind);
                    return Streamed::Failed {
                        live: Some(live),
                        kind,
                    };
                }
            }
        }
    }

    /// Publishes the outcome, then releases the delivery state and re-arms as appropriate.
    fn finish(self: &Arc<Self>, delivery: &Delivery, streamed: Streamed) -> DeliveryOutcome {
        let committed = {
            let mut state = self.lock_state();
            let committed = state.owns(delivery.serial) && !delivery.token.is_cancelled();
            if committed {
                state.active_token = None;
            }
            committed
        };

        match streamed {
            Streamed::Finalized(live) if committed => {
                match live.to_transcript_entry(&self.assistant_display_name) {
                    Some(entry) => self.complete(delivery, live, entry),
                    None => self.fail(delivery, Some(live), FailureKind::Generic),
                }
            }
            // Cancelled after the terminal frame arrived.
            Streamed::Finalized(live) => self.fail(delivery, Some(live), FailureKind::Cancelled),
            Streamed::Failed { live, kind } => self.fail(delivery, live, kind),
        }
    }

    fn complete(
        self: &Arc<Self>,
        delivery: &Delivery,
        live: LiveMessage,
        entry: TranscriptEntry,
    ) -> DeliveryOutcome {
        self.sink.live_update(&live);
        self.sink.append(&entry);

        {
            let mut state = self.lock_state();
            if state.release(delivery.serial) {
                let (added, origin) = match delivery.kind {
                    DeliveryKind::Reply => (2, ArmOrigin::UserExchange),
                    DeliveryKind::Followup => (1, ArmOrigin::Followup),
                };
                state.total_messages += added;
                if state.session_id == delivery.session_id {
                    self.arm_locked(&mut state, origin);
                }
            }
        }

        self.notifier.delivery_completed(delivery.kind);
        tracing::info!(
            session_id = %delivery.session_id,
            kind = ?delivery.kind,
            message_id = delivery.message_id.0,
            "delivery completed"
        );
        DeliveryOutcome::Delivered(entry)
    }

    fn fail(
        self: &Arc<Self>,
        delivery: &Delivery,
        live: Option<LiveMessage>,
        kind: FailureKind,
    ) -> DeliveryOutcome {
        match delivery.kind {
            DeliveryKind::Reply => {
                let mut live = match live {
                    Some(live) if !live.is_finalized() => live,
                    _ => LiveMessage::new(delivery.message_id, DeliveryKind::Reply),
                };
                live.fail(kind);
                self.sink.live_update(&live);
                if let Some(remediation) = Remediation::for_failure(kind) {
                    self.sink.remediation(remediation);
                }
            }
            DeliveryKind::Followup => {
                if let Some(live) = live {
                    self.sink.live_discarded(live.id());
                }
            }
        }

        {
            let mut state = self.lock_state();
            let released = state.release(delivery.serial);
            let rearm = released
                && delivery.kind == DeliveryKind::Followup
                && kind != FailureKind::Cancelled
                && state.session_id == delivery.session_id;
            if rearm {
                self.arm_locked(&mut state, ArmOrigin::UserExchange);
            }
        }

        tracing::info!(
            session_id = %delivery.session_id,
            kind = ?delivery.kind,
            failure = ?kind,
            "delivery failed"
        );
        DeliveryOutcome::Failed(kind)
    }

    async fn on_timer(self: Arc<Self>, epoch: u64) {
        let (ticket, session_id) = {
            let mut state = self.lock_state();
            let idle = state.delivery.is_idle();
            let enabled = self.toggle.afterthoughts_enabled();
            match state.scheduler.on_timer(epoch, idle, enabled) {
                TimerVerdict::Stale => return,
                TimerVerdict::Disabled => {
                    state.pending_timer = None;
                    tracing::info!("afterthoughts disabled during the delay, disarmed");
                    return;
                }
                // Delivery starts bump the epoch, so this only sees timers armed outside that path.
                TimerVerdict::Deferred(delay) => {
                    tracing::debug!(delay_secs = delay.as_secs(), "delivery busy, check deferred");
                    self.schedule_locked(&mut state, epoch, delay);
                    return;
                }
                TimerVerdict::Check(ticket) => {
                    state.pending_timer = None;
                    (ticket, state.session_id)
                }
            }
        };

        tracing::debug!(
            session_id = %session_id,
            stage = ticket.stage,
            elapsed = %ticket.elapsed_label,
            "asking for an afterthought"
        );
        let request = AfterthoughtRequest::decision(session_id, ticket.elapsed_label.clone());
        let outcome = match self.decisions.decide(request).await {
            Ok(decision) if decision.decision => DecisionOutcome::Granted {
                inner_dialogue: decision.inner_dialogue,
            },
            Ok(_) => DecisionOutcome::Declined,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    stage = ticket.stage,
                    error = %error,
                    "afterthought decision request failed"
                );
                DecisionOutcome::Unreachable
            }
        };

        let start = {
            let mut state = self.lock_state();
            match state.scheduler.on_decision(&ticket, outcome, Instant::now()) {
                DecisionVerdict::Stale => return,
                DecisionVerdict::Exhausted => {
                    tracing::info!(session_id = %session_id, "afterthought ladder exhausted");
                    return;
                }
                DecisionVerdict::Rescheduled(arming) => {
                    self.schedule_locked(&mut state, arming.epoch, arming.delay);
                    return;
                }
                DecisionVerdict::Granted { inner_dialogue } => {
                    match self.begin_followup_locked(&mut state, inner_dialogue) {
                        Ok(start) => start,
                        Err(rejection) => {
                            tracing::warn!(rejection = ?rejection, "granted follow-up could not start");
                            return;
                        }
                    }
                }
            }
        };

        let outcome = self.run_followup(start).await;
        tracing::debug!(delivered = outcome.is_delivered(), "afterthought delivery finished");
    }
}

fn timer_fired(inner: Weak<Inner>, epoch: u64) -> TimerCallback {
    Box::pin(async move {
        if let Some(inner) = inner.upgrade() {
            inner.on_timer(epoch).await;
        }
    })
}

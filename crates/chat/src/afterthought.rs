use std::time::{Duration, Instant};

/// Default escalation delays, in seconds.
pub const DEFAULT_LADDER_SECS: [u64; 5] = [10, 60, 300, 900, 3600];
/// Stage the ladder resumes at after a delivered follow-up.
pub const FOLLOWUP_RESUME_STAGE: usize = 2;

/// Ordered, escalating quiet periods between checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ladder {
    delays: Vec<Duration>,
}

impl Ladder {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn delay(&self, stage: usize) -> Option<Duration> {
        self.delays.get(stage).copied()
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for Ladder {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_LADDER_SECS)
    }
}

/// Human-readable label for a nominal delay, e.g. `"5 minutes"`.
pub fn elapsed_label(delay: Duration) -> String {
    let secs = delay.as_secs();
    let (value, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86_400, "day")
    };

    if value == 1 {
        format!("1 {unit}")
    } else {
        format!("{value} {unit}s")
    }
}

/// Where an arm request comes from; decides the starting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArmOrigin {
    /// A user-authored exchange finished (or a follow-up failed).
    UserExchange,
    /// A follow-up was delivered.
    Followup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerPhase {
    Disarmed,
    Armed { stage: usize },
    Checking { stage: usize },
    Exhausted,
}

/// Snapshot of the scheduler's timer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfterthoughtTimerState {
    pub active: bool,
    pub stage: usize,
    pub armed_at: Option<Instant>,
}

/// A timer the driver must start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arming {
    pub epoch: u64,
    pub stage: usize,
    pub delay: Duration,
}

/// One outstanding decision request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTicket {
    pub epoch: u64,
    pub stage: usize,
    pub elapsed_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerVerdict {
    /// The timer belongs to an earlier arming.
    Stale,
    /// The feature was switched off during the delay; the scheduler disarmed.
    Disabled,
    /// A delivery is in flight; wait the same delay again without advancing.
    Deferred(Duration),
    Check(CheckTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Granted { inner_dialogue: Option<String> },
    Declined,
    /// The decision endpoint could not be reached.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionVerdict {
    Stale,
    Granted { inner_dialogue: Option<String> },
    Rescheduled(Arming),
    Exhausted,
}

/// Escalation state machine for unsolicited follow-ups.
///
/// The scheduler owns no timers and performs no I/O. The driver starts a timer for every
/// [`Arming`] it returns and reports back through [`on_timer`](Self::on_timer) and
/// [`on_decision`](Self::on_decision). Each arm or disarm bumps the epoch, so callbacks from
/// an earlier arming are recognised and dropped.
#[derive(Debug, Clone)]
pub struct AfterthoughtScheduler {
    ladder: Ladder,
    resume_stage: usize,
    phase: SchedulerPhase,
    epoch: u64,
    armed_at: Option<Instant>,
    last_label: Option<String>,
}

impl Default for AfterthoughtScheduler {
    fn default() -> Self {
        Self::new(Ladder::default(), FOLLOWUP_RESUME_STAGE)
    }
}

impl AfterthoughtScheduler {
    pub fn new(ladder: Ladder, resume_stage: usize) -> Self {
        Self {
            ladder,
            resume_stage,
            phase: SchedulerPhase::Disarmed,
            epoch: 0,
            armed_at: None,
            last_label: None,
        }
    }

    pub fn ladder(&self) -> &Ladder {
        &self.ladder
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Label sent with the most recent decision request.
    pub fn last_elapsed_label(&self) -> Option<&str> {
        self.last_label.as_deref()
    }

    pub fn snapshot(&self) -> AfterthoughtTimerState {
        let (active, stage) = match self.phase {
            SchedulerPhase::Armed { stage } | SchedulerPhase::Checking { stage } => (true, stage),
            SchedulerPhase::Disarmed => (false, 0),
            SchedulerPhase::Exhausted => (false, self.ladder.len()),
        };
        AfterthoughtTimerState {
            active,
            stage,
            armed_at: self.armed_at,
        }
    }

    /// Arms from the stage `origin` dictates, or disarms when the feature is off.
    pub fn arm(&mut self, origin: ArmOrigin, enabled: bool, now: Instant) -> Option<Arming> {
        self.epoch += 1;
        if !enabled {
            self.phase = SchedulerPhase::Disarmed;
            self.armed_at = None;
            return None;
        }

        let stage = match origin {
            ArmOrigin::UserExchange => 0,
            ArmOrigin::Followup => self.resume_stage,
        };
        self.enter_stage(stage, now)
    }

    /// Returns true if anything was armed or checking.
    pub fn disarm(&mut self) -> bool {
        self.epoch += 1;
        let was_active = matches!(
            self.phase,
            SchedulerPhase::Armed { .. } | SchedulerPhase::Checking { .. }
        );
        self.phase = SchedulerPhase::Disarmed;
        self.armed_at = None;
        was_active
    }

    pub fn on_timer(&mut self, epoch: u64, delivery_idle: bool, enabled: bool) -> TimerVerdict {
        if epoch != self.epoch {
            return TimerVerdict::Stale;
        }
        let SchedulerPhase::Armed { stage } = self.phase else {
            return TimerVerdict::Stale;
        };

        if !enabled {
            self.disarm();
            return TimerVerdict::Disabled;
        }

        let Some(delay) = self.ladder.delay(stage) else {
            self.phase = SchedulerPhase::Exhausted;
            return TimerVerdict::Stale;
        };

        if !delivery_idle {
            return TimerVerdict::Deferred(delay);
        }

        let label = elapsed_label(delay);
        self.last_label = Some(label.clone());
        self.phase = SchedulerPhase::Checking { stage };
        TimerVerdict::Check(CheckTicket {
            epoch,
            stage,
            elapsed_label: label,
        })
    }

    pub fn on_decision(
        &mut self,
        ticket: &CheckTicket,
        outcome: DecisionOutcome,
        now: Instant,
    ) -> DecisionVerdict {
        if ticket.epoch != self.epoch
            || self.phase != (SchedulerPhase::Checking { stage: ticket.stage })
        {
            return DecisionVerdict::Stale;
        }

        match outcome {
            DecisionOutcome::Granted { inner_dialogue } => {
                // The follow-up delivery re-arms on completion.
                self.epoch += 1;
                self.phase = SchedulerPhase::Disarmed;
                self.armed_at = None;
                DecisionVerdict::Granted { inner_dialogue }
            }
            DecisionOutcome::Declined | DecisionOutcome::Unreachable => {
                self.epoch += 1;
                match self.enter_stage(ticket.stage + 1, now) {
                    Some(arming) => DecisionVerdict::Rescheduled(arming),
                    None => DecisionVerdict::Exhausted,
                }
            }
        }
    }

    fn enter_stage(&mut self, stage: usize, now: Instant) -> Option<Arming> {
        match self.ladder.delay(stage) {
            Some(delay) => {
                self.phase = SchedulerPhase::Armed { stage };
                self.armed_at = Some(now);
                Some(Arming {
                    epoch: self.epoch,
                    stage,
                    delay,
                })
            }
            None => {
                self.phase = SchedulerPhase::Exhausted;
                self.armed_at = None;
                None
            }
        }
    }
}

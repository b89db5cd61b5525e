#![deny(unsafe_code)]

//! Real-time delivery core of the lull chat client.
//!
//! [`Messenger`] turns one user message into a streamed, incrementally rendered reply and
//! runs the afterthought scheduler that lets the assistant follow up after a quiet period.

pub mod afterthought;
pub mod clock;
pub mod message;
pub mod messenger;
pub mod render;
pub mod settings;
pub mod sink;
pub mod terminal;

pub use afterthought::{
    AfterthoughtScheduler, AfterthoughtTimerState, ArmOrigin, DEFAULT_LADDER_SECS,
    FOLLOWUP_RESUME_STAGE, Ladder, SchedulerPhase, elapsed_label,
};
pub use clock::{ActivityClock, ManualClock, TimerCallback, TimerHandle, TimerId, TokioClock};
pub use message::{
    DeliveryKind, DeliveryOutcome, DeliveryRejection, DeliveryState, FailureKind, MessageId,
    TranscriptEntry,
};
pub use messenger::{Messenger, MessengerBuilder};
pub use render::{DisplayText, LiveMessage, LivePhase, Segment, render_display};
pub use settings::{Settings, SettingsError, SettingsResult, SettingsStore};
pub use sink::{
    AfterthoughtToggle, DeliveryNotifier, Remediation, SilentNotifier, TranscriptSink,
};

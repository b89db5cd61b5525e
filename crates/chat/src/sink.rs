use std::sync::atomic::{AtomicBool, Ordering};

use crate::message::{DeliveryKind, FailureKind, MessageId, TranscriptEntry};
use crate::render::LiveMessage;

/// Dedicated prompts for failures the user can fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Remediation {
    MissingCredential,
    QuotaExhausted,
}

impl Remediation {
    pub fn for_failure(kind: FailureKind) -> Option<Self> {
        match kind {
            FailureKind::MissingCredential => Some(Self::MissingCredential),
            FailureKind::QuotaExhausted => Some(Self::QuotaExhausted),
            FailureKind::Generic | FailureKind::Connection | FailureKind::Cancelled => None,
        }
    }
}

/// Receives everything the delivery core shows to the user.
///
/// `append` is called once per finalized message. `live_update` is called for every change to
/// a message under construction, including its terminal state; `live_discarded` removes one
/// that must leave no trace.
pub trait TranscriptSink: Send + Sync {
    fn append(&self, entry: &TranscriptEntry);

    fn live_update(&self, message: &LiveMessage);

    fn live_discarded(&self, id: MessageId);

    fn remediation(&self, _remediation: Remediation) {}
}

/// Fires once per completed delivery.
pub trait DeliveryNotifier: Send + Sync {
    fn delivery_completed(&self, kind: DeliveryKind);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl DeliveryNotifier for SilentNotifier {
    fn delivery_completed(&self, _kind: DeliveryKind) {}
}

/// External switch gating the afterthought scheduler.
pub trait AfterthoughtToggle: Send + Sync {
    fn afterthoughts_enabled(&self) -> bool;
}

impl AfterthoughtToggle for AtomicBool {
    fn afterthoughts_enabled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lull_channel::BoxFuture;
use tokio::task::AbortHandle;

/// Work run when a timer fires.
pub type TimerCallback = BoxFuture<'static, ()>;

const TIMER_PENDING: u8 = 0;
const TIMER_RUNNING: u8 = 1;
const TIMER_CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Handle to one scheduled callback.
///
/// A handle is either pending, running or cancelled, and only a pending handle can change.
/// Cancelling a handle whose callback already started is therefore a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    pub fn new(id: TimerId) -> Self {
        Self {
            id,
            state: Arc::new(AtomicU8::new(TIMER_PENDING)),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Returns true if this call prevented the callback from running.
    pub fn cancel(&self) -> bool {
        self.transition(TIMER_CANCELLED)
    }

    /// Claims the callback for execution; false if it was cancelled first.
    pub fn begin(&self) -> bool {
        self.transition(TIMER_RUNNING)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_CANCELLED
    }

    pub fn has_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMER_RUNNING
    }

    fn transition(&self, next: u8) -> bool {
        self.state
            .compare_exchange(TIMER_PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Delayed, cancelable callbacks.
///
/// Implementations never fire a callback before its delay has elapsed.
pub trait ActivityClock: Send + Sync {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock backed by tokio timers; each callback runs on its own task.
#[derive(Default)]
pub struct TokioClock {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TimerId, AbortHandle>>,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers that have neither fired nor been cancelled.
    pub fn pending_count(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }
}

impl ActivityClock for TokioClock {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = TimerHandle::new(id);
        let task_handle = handle.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if task_handle.begin() {
                callback.await;
            }
        });

        let mut tasks = lock(&self.tasks);
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, task.abort_handle());
        handle
    }

    fn cancel(&self, handle: &TimerHandle) {
        if !handle.cancel() {
            return;
        }
        if let Some(task) = lock(&self.tasks).remove(&handle.id()) {
            task.abort();
        }
    }
}

struct ManualTimer {
    due: Duration,
    handle: TimerHandle,
    callback: TimerCallback,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    timers: Vec<ManualTimer>,
}

/// Deterministic clock that only moves when told to.
///
/// Callbacks run inline inside `advance`/`fire_next`, in due order, so everything a callback
/// awaits has finished when the call returns.
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since the clock was created.
    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    /// Remaining delays of live timers, soonest first.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let state = lock(&self.state);
        let mut delays = state
            .timers
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .map(|timer| timer.due.saturating_sub(state.now))
            .collect::<Vec<_>>();
        delays.sort();
        delays
    }

    pub fn pending_count(&self) -> usize {
        self.pending_delays().len()
    }

    /// Moves time forward by `by`, firing every timer that comes due on the way.
    pub async fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.state).now + by;
        let mut fired = 0;
        while let Some(timer) = self.take_due(target) {
            if timer.handle.begin() {
                timer.callback.await;
                fired += 1;
            }
        }
        lock(&self.state).now = target;
        fired
    }

    /// Jumps to the next live timer and fires it, returning how far time moved.
    pub async fn fire_next(&self) -> Option<Duration> {
        let waited = self.pending_delays().into_iter().next()?;
        self.advance(waited).await;
        Some(waited)
    }

    fn take_due(&self, target: Duration) -> Option<ManualTimer> {
        let mut state = lock(&self.state);
        state.timers.retain(|timer| !timer.handle.is_cancelled());
        let index = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, timer)| timer.due <= target)
            .min_by_key(|(_, timer)| (timer.due, timer.handle.id()))
            .map(|(index, _)| index)?;
        let timer = state.timers.remove(index);
        state.now = timer.due;
        Some(timer)
    }
}

impl ActivityClock for ManualClock {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut state = lock(&self.state);
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let handle = TimerHandle::new(id);
        let due = state.now + delay;
        state.timers.push(ManualTimer {
            due,
            handle: handle.clone(),
            callback,
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_after_begin_is_a_noop() {
        let handle = TimerHandle::new(TimerId(1));
        assert!(handle.begin());
        assert!(!handle.cancel());
        assert!(handle.has_started());
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn manual_clock_never_fires_early() {
        let clock = ManualClock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        clock.schedule(Duration::from_secs(10), counting(&counter));

        assert_eq!(clock.advance(Duration::from_secs(9)).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_delays(), vec![Duration::from_secs(1)]);

        assert_eq!(clock.advance(Duration::from_secs(1)).await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending_count(), 0);
    }

    #[tokio::test]
    async fn manual_clock_skips_cancelled_timers() {
        let clock = ManualClock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = clock.schedule(Duration::from_secs(5), counting(&counter));
        clock.cancel(&handle);

        assert_eq!(clock.fire_next().await, None);
        assert_eq!(clock.advance(Duration::from_secs(60)).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_fires_after_delay() {
        let clock = TokioClock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        clock.schedule(Duration::from_secs(60), counting(&counter));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_cancel_prevents_callback() {
        let clock = TokioClock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = clock.schedule(Duration::from_secs(10), counting(&counter));

        clock.cancel(&handle);
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }
}

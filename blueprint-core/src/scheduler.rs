//! Timer scheduling behind one injectable interface.
//!
//! Every delayed callback in Blueprint (debounce windows, stale timers, TTL
//! invalidation, prefetch intervals) goes through [`Scheduler::after`]. The
//! returned [`TimerHandle`] cancels the callback if it has not fired yet.
//!
//! - [`TokioScheduler`] runs callbacks on the tokio runtime using
//!   `tokio::time`, so tests with a paused clock stay deterministic.
//! - [`ManualScheduler`] is a virtual clock: nothing fires until
//!   [`ManualScheduler::advance`] moves time forward.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A callback scheduled to run once.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Source of time and delayed callbacks.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Time elapsed since the scheduler was created.
    fn now(&self) -> Duration;

    /// Run `task` once after `delay`, unless the returned handle is cancelled first.
    fn after(&self, delay: Duration, task: ScheduledTask) -> TimerHandle;
}

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

impl TimerState {
    /// Marks the timer fired. Returns false if it was cancelled first.
    fn try_fire(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

/// Cancellation token for a scheduled callback.
///
/// Cloning shares the same timer. Dropping a handle does NOT cancel it.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    fn new(state: Arc<TimerState>, abort: Option<tokio::task::AbortHandle>) -> Self {
        Self { state, abort }
    }

    /// A handle for a timer that will never fire.
    pub fn inert() -> Self {
        let state = Arc::new(TimerState::default());
        state.cancelled.store(true, Ordering::Release);
        Self::new(state, None)
    }

    /// Prevent the callback from running. No-op once it has fired.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }

    /// Neither fired nor cancelled.
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.has_fired()
    }
}

// ============================================================================
// TOKIO SCHEDULER
// ============================================================================

/// Scheduler backed by the ambient tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    epoch: tokio::time::Instant,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Scheduler> {
        Arc::new(Self::new())
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Duration {
        tokio::time::Instant::now().duration_since(self.epoch)
    }

    fn after(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::error!(
                    delay_ms = delay.as_millis() as u64,
                    "No tokio runtime available, timer dropped"
                );
                return TimerHandle::inert();
            }
        };

        let state = Arc::new(TimerState::default());
        let timer_state = Arc::clone(&state);
        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if timer_state.try_fire() {
                task();
            }
        });

        TimerHandle::new(state, Some(join.abort_handle()))
    }
}

// ============================================================================
// MANUAL SCHEDULER
// ============================================================================

struct PendingTimer {
    task: ScheduledTask,
    state: Arc<TimerState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    // (due, seq) keeps same-deadline timers in scheduling order
    queue: BTreeMap<(Duration, u64), PendingTimer>,
}

/// Virtual-time scheduler for deterministic tests and host-driven loops.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move the clock forward by `by`, firing every timer that falls due.
    ///
    /// Callbacks run outside the internal lock, in deadline order, with the
    /// clock set to their deadline. Timers scheduled by a callback fire in
    /// the same call if they fall due before the target time.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;

        loop {
            let next = {
                let mut state = self.lock();
                let due = state
                    .queue
                    .keys()
                    .next()
                    .copied()
                    .filter(|(due, _)| *due <= target);
                match due {
                    Some(key) => {
                        state.now = key.0;
                        state.queue.remove(&key)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            match next {
                Some(timer) => {
                    if timer.state.try_fire() {
                        (timer.task)();
                    }
                }
                None => break,
            }
        }
    }

    /// Number of timers that are neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        self.lock()
            .queue
            .values()
            .filter(|t| !t.state.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Number of entries held in the queue, cancelled ones included.
    /// Cancelled entries are dropped the next time a timer is scheduled.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &state.now)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Duration {
        self.lock().now
    }

    fn after(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let state = Arc::new(TimerState::default());
        let mut inner = self.lock();
        inner
            .queue
            .retain(|_, t| !t.state.cancelled.load(Ordering::Acquire));
        let due = inner.now + delay;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.insert(
            (due, seq),
            PendingTimer {
                task,
                state: Arc::clone(&state),
            },
        );
        TimerHandle::new(state, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> ScheduledTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_scheduler_fires_when_due() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.after(Duration::from_millis(100), counter_task(&fired));

        scheduler.advance(Duration::from_millis(99));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.has_fired());
        assert_eq!(scheduler.now(), Duration::from_millis(100));
    }

    #[test]
    fn test_manual_scheduler_cancel() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.after(Duration::from_millis(10), counter_task(&fired));
        assert_eq!(scheduler.pending(), 1);

        handle.cancel();
        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!handle.has_fired());
    }

    #[test]
    fn test_manual_scheduler_drops_cancelled_timers() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..1_000 {
            scheduler
                .after(Duration::from_secs(60), counter_task(&fired))
                .cancel();
        }
        assert!(scheduler.queued() <= 1);
        assert_eq!(scheduler.pending(), 0);

        let live = scheduler.after(Duration::from_secs(60), counter_task(&fired));
        assert_eq!(scheduler.queued(), 1);
        scheduler.advance(Duration::from_secs(60));
        assert!(live.has_fired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_scheduler_runs_in_deadline_order() {
        let scheduler = Arc::new(ManualScheduler::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let order = Arc::clone(&order);
            scheduler.after(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        scheduler.advance(Duration::from_millis(50));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_manual_scheduler_nested_timers() {
        let scheduler = Arc::new(ManualScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let inner_fired = Arc::clone(&fired);
        scheduler.after(
            Duration::from_millis(10),
            Box::new(move || {
                inner_scheduler.after(Duration::from_millis(10), counter_task(&inner_fired));
            }),
        );

        scheduler.advance(Duration::from_millis(25));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.now(), Duration::from_millis(25));
    }

    #[test]
    fn test_inert_handle_never_pending() {
        let handle = TimerHandle::inert();
        assert!(handle.is_cancelled());
        assert!(!handle.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_after_delay() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.after(Duration::from_millis(100), counter_task(&fired));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.has_fired());
        assert!(scheduler.now() >= Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.after(Duration::from_millis(100), counter_task(&fired));

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tokio_scheduler_without_runtime_is_inert() {
        let scheduler = TokioScheduler::new();
        let handle = scheduler.after(Duration::from_millis(1), Box::new(|| {}));
        assert!(handle.is_cancelled());
    }
}

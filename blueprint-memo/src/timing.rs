//! Debounce and throttle.
//!
//! Both take their clock from an injected [`Scheduler`]; neither spawns
//! threads of its own.

use blueprint_core::{Scheduler, TimerHandle};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// DEBOUNCE
// ============================================================================

struct DebounceSlot<A> {
    generation: u64,
    pending: Option<(TimerHandle, A)>,
}

/// Trailing-edge debounce.
///
/// Each [`call`](Debouncer::call) (re)starts the quiet window; the callback
/// runs once, with the arguments of the last call, after `delay` passes
/// without another call. Dropping the debouncer cancels a pending call.
pub struct Debouncer<A: Send + 'static> {
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    callback: Arc<dyn Fn(A) + Send + Sync>,
    slot: Arc<Mutex<DebounceSlot<A>>>,
}

impl<A: Send + 'static> Debouncer<A> {
    pub fn new<F>(scheduler: Arc<dyn Scheduler>, delay: Duration, callback: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            scheduler,
            delay,
            callback: Arc::new(callback),
            slot: Arc::new(Mutex::new(DebounceSlot {
                generation: 0,
                pending: None,
            })),
        }
    }

    pub fn call(&self, args: A) {
        let mut slot = lock(&self.slot);
        if let Some((handle, _)) = slot.pending.take() {
            handle.cancel();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let shared = Arc::clone(&self.slot);
        let callback = Arc::clone(&self.callback);
        let handle = self.scheduler.after(
            self.delay,
            Box::new(move || {
                let args = {
                    let mut slot = lock(&shared);
                    if slot.generation != generation {
                        return;
                    }
                    slot.pending.take().map(|(_, args)| args)
                };
                if let Some(args) = args {
                    callback(args);
                }
            }),
        );
        slot.pending = Some((handle, args));
    }

    /// Run the pending call now, if any. Returns whether a call ran.
    pub fn flush(&self) -> bool {
        let pending = lock(&self.slot).pending.take();
        match pending {
            Some((handle, args)) => {
                handle.cancel();
                (self.callback)(args);
                true
            }
            None => false,
        }
    }

    /// Drop the pending call without running it.
    pub fn cancel(&self) {
        if let Some((handle, _)) = lock(&self.slot).pending.take() {
            handle.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<A: Send + 'static> Drop for Debouncer<A> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<A: Send + 'static> fmt::Debug for Debouncer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish()
    }
}

// ============================================================================
// DEBOUNCED VALUE
// ============================================================================

/// Value-level debounce: readers see the last settled value until writes go
/// quiet for `delay`.
pub struct DebouncedValue<T: Clone + Send + 'static> {
    settled: Arc<Mutex<T>>,
    debouncer: Debouncer<T>,
}

impl<T: Clone + Send + 'static> DebouncedValue<T> {
    pub fn new(scheduler: Arc<dyn Scheduler>, initial: T, delay: Duration) -> Self {
        let settled = Arc::new(Mutex::new(initial));
        let target = Arc::clone(&settled);
        let debouncer = Debouncer::new(scheduler, delay, move |value: T| {
            *lock(&target) = value;
        });
        Self { settled, debouncer }
    }

    pub fn set(&self, value: T) {
        self.debouncer.call(value);
    }

    /// The last settled value.
    pub fn get(&self) -> T {
        lock(&self.settled).clone()
    }

    /// True while a newer value is waiting out its quiet window.
    pub fn is_settling(&self) -> bool {
        self.debouncer.is_pending()
    }
}

impl<T: Clone + Send + fmt::Debug + 'static> fmt::Debug for DebouncedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedValue")
            .field("settled", &self.get())
            .field("settling", &self.is_settling())
            .finish()
    }
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Leading-edge throttle that drops, rather than queues, calls made within
/// `interval` of the last executed call.
pub struct Throttle<A> {
    scheduler: Arc<dyn Scheduler>,
    interval: Duration,
    callback: Box<dyn Fn(A) + Send + Sync>,
    last_run: Mutex<Option<Duration>>,
}

impl<A> Throttle<A> {
    pub fn new<F>(scheduler: Arc<dyn Scheduler>, interval: Duration, callback: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            scheduler,
            interval,
            callback: Box::new(callback),
            last_run: Mutex::new(None),
        }
    }

    /// Returns true if the callback ran.
    pub fn call(&self, args: A) -> bool {
        let now = self.scheduler.now();
        {
            let mut last_run = lock(&self.last_run);
            if let Some(last) = *last_run {
                if now.saturating_sub(last) < self.interval {
                    return false;
                }
            }
            *last_run = Some(now);
        }
        (self.callback)(args);
        true
    }

    pub fn reset(&self) {
        *lock(&self.last_run) = None;
    }
}

impl<A> fmt::Debug for Throttle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("interval", &self.interval)
            .field("last_run", &*lock(&self.last_run))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueprint_core::ManualScheduler;

    fn recorder<A: Send + 'static>() -> (Arc<Mutex<Vec<A>>>, impl Fn(A) + Send + Sync + 'static) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        (calls, move |args: A| sink.lock().unwrap().push(args))
    }

    #[test]
    fn test_debounce_collapses_burst_into_last_call() {
        let scheduler = ManualScheduler::shared();
        let (calls, callback) = recorder::<u32>();
        let debounced = Debouncer::new(scheduler.clone(), Duration::from_millis(100), callback);

        debounced.call(1);
        scheduler.advance(Duration::from_millis(50));
        debounced.call(2);
        scheduler.advance(Duration::from_millis(50));
        debounced.call(3);
        scheduler.advance(Duration::from_millis(99));
        assert!(calls.lock().unwrap().is_empty());

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(*calls.lock().unwrap(), vec![3]);
        assert!(!debounced.is_pending());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_debounce_has_no_leading_edge() {
        let scheduler = ManualScheduler::shared();
        let (calls, callback) = recorder::<&'static str>();
        let debounced = Debouncer::new(scheduler.clone(), Duration::from_millis(10), callback);

        debounced.call("first");
        assert!(calls.lock().unwrap().is_empty());
        assert!(debounced.is_pending());
    }

    #[test]
    fn test_debounce_flush_and_cancel() {
        let scheduler = ManualScheduler::shared();
        let (calls, callback) = recorder::<u32>();
        let debounced = Debouncer::new(scheduler.clone(), Duration::from_millis(100), callback);

        debounced.call(7);
        assert!(debounced.flush());
        assert_eq!(*calls.lock().unwrap(), vec![7]);
        scheduler.advance(Duration::from_millis(200));
        assert_eq!(calls.lock().unwrap().len(), 1);

        debounced.call(8);
        debounced.cancel();
        scheduler.advance(Duration::from_millis(200));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!debounced.flush());
    }

    #[test]
    fn test_debounce_drop_cancels_pending() {
        let scheduler = ManualScheduler::shared();
        let (calls, callback) = recorder::<u32>();
        {
            let debounced =
                Debouncer::new(scheduler.clone(), Duration::from_millis(100), callback);
            debounced.call(1);
        }
        scheduler.advance(Duration::from_millis(200));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_debounced_value_settles_after_quiet_window() {
        let scheduler = ManualScheduler::shared();
        let value = DebouncedValue::new(scheduler.clone(), "".to_string(), Duration::from_millis(300));

        value.set("c".to_string());
        scheduler.advance(Duration::from_millis(100));
        value.set("co".to_string());
        scheduler.advance(Duration::from_millis(100));
        value.set("com".to_string());
        assert_eq!(value.get(), "");
        assert!(value.is_settling());

        scheduler.advance(Duration::from_millis(300));
        assert_eq!(value.get(), "com");
        assert!(!value.is_settling());
    }

    #[test]
    fn test_throttle_drops_calls_within_interval() {
        let scheduler = ManualScheduler::shared();
        let (calls, callback) = recorder::<u32>();
        let throttled = Throttle::new(scheduler.clone(), Duration::from_millis(100), callback);

        let ran: Vec<bool> = (1..=5).map(|i| throttled.call(i)).collect();
        assert_eq!(ran, vec![true, false, false, false, false]);
        assert_eq!(*calls.lock().unwrap(), vec![1]);

        scheduler.advance(Duration::from_millis(150));
        assert!(throttled.call(6));
        assert_eq!(*calls.lock().unwrap(), vec![1, 6]);
    }

    #[test]
    fn test_throttle_window_measured_from_last_executed_call() {
        let scheduler = ManualScheduler::shared();
        let (calls, callback) = recorder::<u32>();
        let throttled = Throttle::new(scheduler.clone(), Duration::from_millis(100), callback);

        throttled.call(1);
        scheduler.advance(Duration::from_millis(60));
        assert!(!throttled.call(2));
        scheduler.advance(Duration::from_millis(40));
        assert!(throttled.call(3));

        throttled.reset();
        assert!(throttled.call(4));
        assert_eq!(*calls.lock().unwrap(), vec![1, 3, 4]);
    }
}

//! Time-boxed dependency memo.

use blueprint_core::{Scheduler, TimerHandle};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::equality::deps_changed;

/// Like [`DeepMemo`](crate::DeepMemo), but a value also expires `ttl` after
/// it was computed.
///
/// Each computed value arms exactly one invalidation timer; recomputing
/// cancels the previous timer before arming the next, so repeated reads
/// never stack timers. Dropping the memo cancels its timer.
pub struct TtlMemo<T> {
    scheduler: Arc<dyn Scheduler>,
    ttl: Duration,
    deps: Option<Vec<Value>>,
    value: Option<T>,
    expires_at: Duration,
    expired: Arc<AtomicBool>,
    timer: Option<TimerHandle>,
    computations: u64,
}

impl<T> TtlMemo<T> {
    pub fn new(scheduler: Arc<dyn Scheduler>, ttl: Duration) -> Self {
        Self {
            scheduler,
            ttl,
            deps: None,
            value: None,
            expires_at: Duration::ZERO,
            expired: Arc::new(AtomicBool::new(false)),
            timer: None,
            computations: 0,
        }
    }

    pub fn get<F>(&mut self, deps: &[Value], factory: F) -> &T
    where
        F: FnOnce() -> T,
    {
        let changed = match &self.deps {
            Some(prev) => deps_changed(prev, deps),
            None => true,
        };
        if changed || self.is_expired() {
            self.deps = Some(deps.to_vec());
            self.value = None;
            self.arm();
        }
        self.value.get_or_insert_with(factory)
    }

    /// True once the current value has outlived its ttl (or there is none).
    pub fn is_expired(&self) -> bool {
        self.value.is_none()
            || self.expired.load(Ordering::Acquire)
            || self.scheduler.now() >= self.expires_at
    }

    /// Drop the current value and its pending timer.
    pub fn invalidate(&mut self) {
        self.cancel_timer();
        self.value = None;
        self.deps = None;
    }

    pub fn computations(&self) -> u64 {
        self.computations
    }

    /// Whether an invalidation timer is currently armed.
    pub fn has_pending_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(TimerHandle::is_pending)
    }

    fn arm(&mut self) {
        self.cancel_timer();
        self.computations += 1;
        self.expires_at = self.scheduler.now() + self.ttl;

        let expired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&expired);
        self.expired = expired;
        self.timer = Some(self.scheduler.after(
            self.ttl,
            Box::new(move || flag.store(true, Ordering::Release)),
        ));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl<T> Drop for TtlMemo<T> {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

impl<T> fmt::Debug for TtlMemo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlMemo")
            .field("ttl", &self.ttl)
            .field("has_value", &self.value.is_some())
            .field("expires_at", &self.expires_at)
            .field("computations", &self.computations)
            .finish()
    }
}

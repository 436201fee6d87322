//! Blueprint Memo - Memoization Toolkit
//!
//! Small, self-contained primitives for avoiding repeated work:
//!
//! - [`deep_equal`] / [`DeepMemo`]: recompute only when dependencies change
//!   structurally.
//! - [`Debouncer`] / [`DebouncedValue`]: collapse bursts into one trailing
//!   call or value.
//! - [`Throttle`]: run at most once per interval, dropping the rest.
//! - [`LruMemo`]: bounded memo keyed by the serialized arguments.
//! - [`TtlMemo`]: dependency memo that also expires after a fixed time.
//!
//! Anything time-based takes an `Arc<dyn Scheduler>` so tests can drive a
//! virtual clock.

pub mod equality;
pub mod lru_memo;
pub mod timing;
pub mod ttl_memo;

pub use equality::{deep_equal, deep_equal_serialized, deps_changed, to_deps, DeepMemo};
pub use lru_memo::{LruMemo, MemoStats};
pub use timing::{DebouncedValue, Debouncer, Throttle};
pub use ttl_memo::TtlMemo;

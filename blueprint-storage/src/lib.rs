//! Blueprint Storage - Normalized Entity Store and Access Tracker
//!
//! The [`EntityStore`] flattens nested query responses into one entry per
//! `(typename, id)` and keeps root query results as trees of references.
//! The [`AccessTracker`] remembers which entities were seen, in order, so
//! the prefetcher can rank them.
//!
//! Neither type locks internally except the tracker's append log; callers
//! that share an [`EntityStore`] wrap it in a mutex and never hold that lock
//! across an await point.

pub mod store;
pub mod tracker;

pub use store::{CacheEntry, DerivedField, EntityStore, ListMergePolicy, Node, TypePolicy};
pub use tracker::AccessTracker;

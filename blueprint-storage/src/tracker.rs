//! Access-frequency tracking.
//!
//! An append-only log of entity observations, ranked on demand. The log is
//! owned by whoever constructs the tracker; there is no process-wide
//! instance.

use blueprint_core::{AccessRecord, ConfigError, EntityKey, PrefetchCandidate, TrackerConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct AccessLog {
    records: VecDeque<AccessRecord>,
    next_sequence: u64,
}

impl AccessLog {
    fn push(&mut self, entity_type: &str, id: &str, max_records: Option<usize>) {
        self.records.push_back(AccessRecord {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;

        if let Some(max) = max_records {
            while self.records.len() > max {
                self.records.pop_front();
            }
        }
    }
}

/// Records which entities were observed and ranks them by frequency.
#[derive(Debug, Default)]
pub struct AccessTracker {
    config: TrackerConfig,
    log: Mutex<AccessLog>,
}

impl AccessTracker {
    /// Create an empty tracker. A `max_records` of zero is rejected.
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            log: Mutex::new(AccessLog::default()),
        })
    }

    /// Append one observation.
    pub fn record(&self, entity_type: &str, id: &str) {
        self.lock().push(entity_type, id, self.config.max_records);
    }

    /// Append many observations under a single lock acquisition.
    pub fn record_all<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a EntityKey>,
    {
        let mut log = self.lock();
        let mut count = 0usize;
        for key in keys {
            log.push(&key.typename, &key.id, self.config.max_records);
            count += 1;
        }
        tracing::trace!(count, total = log.records.len(), "Recorded entity accesses");
    }

    /// The `limit` most frequently observed entities.
    ///
    /// Ordered by access count, highest first; equal counts put the entity
    /// seen most recently first.
    pub fn top_n(&self, limit: usize) -> Vec<PrefetchCandidate> {
        let log = self.lock();

        // (count, last sequence) per entity
        let mut tally: HashMap<(&str, &str), (u64, u64)> = HashMap::new();
        for record in &log.records {
            let slot = tally
                .entry((record.entity_type.as_str(), record.id.as_str()))
                .or_insert((0, record.sequence));
            slot.0 += 1;
            slot.1 = slot.1.max(record.sequence);
        }

        let mut ranked: Vec<_> = tally.into_iter().collect();
        ranked.sort_by(|(_, (count_a, last_a)), (_, (count_b, last_b))| {
            count_b.cmp(count_a).then(last_b.cmp(last_a))
        });

        ranked
            .into_iter()
            .take(limit)
            .map(|((entity_type, id), (score, _))| PrefetchCandidate {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
                score,
            })
            .collect()
    }

    /// Copy of the retained log, oldest first.
    pub fn snapshot(&self) -> Vec<AccessRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the log. Sequence numbers keep increasing.
    pub fn reset(&self) {
        self.lock().records.clear();
    }

    fn lock(&self) -> MutexGuard<'_, AccessLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn ids(candidates: &[PrefetchCandidate]) -> Vec<String> {
        candidates
            .iter()
            .map(|c| format!("{}:{}", c.entity_type, c.id))
            .collect()
    }

    #[test]
    fn test_top_n_ranks_by_count() {
        let tracker = AccessTracker::default();
        tracker.record("Component", "a");
        tracker.record("Component", "a");
        tracker.record("Component", "a");
        tracker.record("Component", "b");

        let top = tracker.top_n(2);
        assert_eq!(ids(&top), vec!["Component:a", "Component:b"]);
        assert_eq!(top[0].score, 3);
        assert_eq!(top[1].score, 1);
    }

    #[test]
    fn test_top_n_breaks_ties_by_recency() {
        let tracker = AccessTracker::default();
        tracker.record("Team", "x");
        tracker.record("Team", "y");
        tracker.record("Team", "x");
        tracker.record("Team", "y");

        assert_eq!(ids(&tracker.top_n(5)), vec!["Team:y", "Team:x"]);
    }

    #[test]
    fn test_top_n_distinguishes_types() {
        let tracker = AccessTracker::default();
        tracker.record("Component", "1");
        tracker.record("Team", "1");
        tracker.record("Team", "1");
        assert_eq!(ids(&tracker.top_n(10)), vec!["Team:1", "Component:1"]);
        assert!(tracker.top_n(0).is_empty());
    }

    #[test]
    fn test_record_all_and_snapshot_order() {
        let tracker = AccessTracker::default();
        let keys = [
            EntityKey::new("Component", "1"),
            EntityKey::new("Instance", "10"),
        ];
        tracker.record_all(&keys);

        let records = tracker.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key(), keys[0]);
        assert!(records[0].sequence < records[1].sequence);
    }

    #[test]
    fn test_max_records_drops_oldest() {
        let tracker = AccessTracker::new(TrackerConfig::default().with_max_records(2)).unwrap();
        tracker.record("Component", "old");
        tracker.record("Component", "mid");
        tracker.record("Component", "new");

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.snapshot()[0].id, "mid");
    }

    #[test]
    fn test_new_rejects_zero_max_records() {
        let result = AccessTracker::new(TrackerConfig::default().with_max_records(0));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_reset_clears_log() {
        let tracker = AccessTracker::default();
        tracker.record("Component", "1");
        tracker.reset();
        assert!(tracker.is_empty());
        assert!(tracker.top_n(5).is_empty());
    }

    #[test]
    fn test_concurrent_appends_are_all_kept() {
        let tracker = Arc::new(AccessTracker::default());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        tracker.record("Component", &format!("{}", (t * 100 + i) % 7));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.len(), 400);
        let total: u64 = tracker.top_n(7).iter().map(|c| c.score).sum();
        assert_eq!(total, 400);
    }

    proptest! {
        #[test]
        fn prop_top_n_sorted_and_bounded(
            accesses in prop::collection::vec(0u8..6, 0..60),
            limit in 0usize..8,
        ) {
            let tracker = AccessTracker::default();
            for id in &accesses {
                tracker.record("Component", &id.to_string());
            }
            let top = tracker.top_n(limit);

            prop_assert!(top.len() <= limit);
            prop_assert!(top.windows(2).all(|w| w[0].score >= w[1].score));
            for candidate in &top {
                let expected = accesses
                    .iter()
                    .filter(|id| id.to_string() == candidate.id)
                    .count() as u64;
                prop_assert_eq!(candidate.score, expected);
            }
        }
    }
}

//! # Lock-Free State Aggregator
//!
//! Holds exactly one reference to the current [`Snapshot`]. Readers take a
//! cheap atomic load and always see a complete snapshot. Writers build the
//! successor off to the side and publish it with a compare-and-swap on the
//! reference; a writer that loses the race re-reads the winner and recomputes,
//! so no update is ever lost and no lock is held across the merge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;

use super::snapshot::{ExtensionMap, Snapshot};

/// # State Aggregator
///
/// Single source of truth for the gateway state. Share it behind an `Arc`.
pub struct StateAggregator {
    current: ArcSwap<Snapshot>,
    contention_retries: AtomicU64,
}

impl Default for StateAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StateAggregator {
    /// Starts from the default snapshot (`deviceStatus = "Unknown"`, empty bag).
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::default())
    }

    /// Starts from a caller-provided snapshot.
    pub fn with_snapshot(initial: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            contention_retries: AtomicU64::new(0),
        }
    }

    /// Returns the current snapshot. Never blocks and never observes a
    /// half-built value.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// # Update
    ///
    /// Applies `transform` to the current snapshot and publishes the result.
    ///
    /// The transform may run more than once under contention, each time against
    /// the latest published snapshot, so it must be a pure function of its input.
    /// The published snapshot gets `sequence = previous.sequence + 1`.
    pub fn update<F>(&self, mut transform: F) -> Arc<Snapshot>
    where
        F: FnMut(&Snapshot) -> Snapshot,
    {
        let mut current = self.current.load_full();
        loop {
            let mut next = transform(&current);
            next.sequence = current.sequence + 1;
            let next = Arc::new(next);

            let previous = self.current.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &current) {
                return next;
            }

            // Lost the race: retry against whatever won.
            self.contention_retries.fetch_add(1, Ordering::Relaxed);
            current = arc_swap::Guard::into_inner(previous);
        }
    }

    /// Merges `incoming` into the current extension bag and stamps the result
    /// with the current time.
    pub fn merge(&self, incoming: &ExtensionMap) -> Arc<Snapshot> {
        self.update(|current| current.merged(incoming, Utc::now()))
    }

    /// Publish counter of the current snapshot. Only a winning swap advances it.
    pub fn version(&self) -> u64 {
        self.current.load().sequence
    }

    /// How many times a writer had to recompute because another writer
    /// published first.
    pub fn contention_retries(&self) -> u64 {
        self.contention_retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::ExtensionValue;
    use std::thread;

    const COUNTER: &str = "test.counter";

    fn increment(current: &Snapshot) -> Snapshot {
        let value = current
            .extensions
            .get(COUNTER)
            .and_then(ExtensionValue::as_f64)
            .unwrap_or(0.0);
        let mut next = current.clone();
        next.extensions
            .insert(COUNTER.to_string(), ExtensionValue::Number(value + 1.0));
        next
    }

    #[test]
    fn starts_unknown_and_empty() {
        let agg = StateAggregator::new();
        let snap = agg.snapshot();
        assert_eq!(snap.device_status, "Unknown");
        assert!(snap.extensions.is_empty());
        assert_eq!(snap.sequence(), 0);
    }

    #[test]
    fn update_publishes_and_bumps_sequence() {
        let agg = StateAggregator::new();
        let published = agg.update(increment);
        assert_eq!(published.sequence(), 1);
        assert!(Arc::ptr_eq(&published, &agg.snapshot()));

        let mut incoming = ExtensionMap::new();
        incoming.insert("deviceStatus".into(), "Online".into());
        let merged = agg.merge(&incoming);
        assert_eq!(merged.sequence(), 2);
        assert_eq!(merged.device_status, "Online");
        assert_eq!(merged.extensions[COUNTER], ExtensionValue::Number(1.0));
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let agg = Arc::new(StateAggregator::new());
        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        agg.update(increment);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = agg.snapshot();
        let total = (threads * per_thread) as f64;
        assert_eq!(snap.extensions[COUNTER], ExtensionValue::Number(total));
        assert_eq!(snap.sequence(), (threads * per_thread) as u64);
        assert_eq!(agg.version(), snap.sequence());
    }

    #[test]
    fn readers_never_see_a_partial_snapshot() {
        let agg = Arc::new(StateAggregator::new());

        let writer = {
            let agg = Arc::clone(&agg);
            thread::spawn(move || {
                for i in 0..2_000u32 {
                    let tag = i.to_string();
                    agg.update(|current| {
                        let mut next = current.clone();
                        next.device_name = tag.clone();
                        next.extensions
                            .insert("test.mirror".into(), ExtensionValue::Text(tag.clone()));
                        next
                    });
                }
            })
        };

        for _ in 0..2_000 {
            let snap = agg.snapshot();
            if let Some(mirror) = snap.extensions.get("test.mirror") {
                assert_eq!(mirror.to_string(), snap.device_name);
            }
        }
        writer.join().unwrap();
    }
}

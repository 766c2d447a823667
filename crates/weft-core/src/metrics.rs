//! Named counter registries.
//!
//! Each network-facing component owns a registry of monotonically increasing
//! counters. Two snapshot flavors exist: `check_metrics` reads without
//! resetting, `get_metrics` reads and resets. Periodic collectors use the
//! latter so each snapshot covers one interval.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of counter values keyed by counter name.
pub type MetricsSnapshot = BTreeMap<&'static str, u64>;

/// A fixed set of named atomic counters.
///
/// The counter set is declared at construction; incrementing an undeclared
/// name is a no-op logged at debug level, never an error.
#[derive(Debug)]
pub struct MetricsRegistry {
    counters: Vec<(&'static str, AtomicU64)>,
}

impl MetricsRegistry {
    /// Registry with the given counter names, all starting at zero.
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            counters: names.iter().map(|name| (*name, AtomicU64::new(0))).collect(),
        }
    }

    /// Increment a counter by one.
    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a counter by `n`.
    pub fn add(&self, name: &str, n: u64) {
        match self.counters.iter().find(|(k, _)| *k == name) {
            Some((_, counter)) => {
                counter.fetch_add(n, Ordering::Relaxed);
            }
            None => tracing::debug!(counter = name, "increment of undeclared counter"),
        }
    }

    /// Snapshot all counters without resetting them.
    pub fn check_metrics(&self) -> MetricsSnapshot {
        self.counters
            .iter()
            .map(|(name, counter)| (*name, counter.load(Ordering::Relaxed)))
            .collect()
    }

    /// Snapshot all counters and reset them to zero.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.counters
            .iter()
            .map(|(name, counter)| (*name, counter.swap(0, Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_keeps_values_get_resets() {
        let metrics = MetricsRegistry::new(&["messages_sent", "messages_received"]);
        metrics.inc("messages_sent");
        metrics.add("messages_sent", 2);

        let checked = metrics.check_metrics();
        assert_eq!(checked["messages_sent"], 3);
        assert_eq!(checked["messages_received"], 0);
        // check does not reset
        assert_eq!(metrics.check_metrics()["messages_sent"], 3);

        let taken = metrics.get_metrics();
        assert_eq!(taken["messages_sent"], 3);
        // get resets
        assert_eq!(metrics.check_metrics()["messages_sent"], 0);
    }

    #[test]
    fn undeclared_counter_is_ignored() {
        let metrics = MetricsRegistry::new(&["a"]);
        metrics.inc("nonexistent");
        assert_eq!(metrics.check_metrics().len(), 1);
    }
}

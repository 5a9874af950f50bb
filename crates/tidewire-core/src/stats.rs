//! Statistics sink
//!
//! Transfers report `record(name, count, bytes)` to a [`StatsSink`]. The
//! sink is optional; [`NoopStats`] discards everything.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// Well-known statistic names
pub mod names {
    pub const SEND: &str = "send";
    pub const SEND_ERROR: &str = "send_error";
    pub const RECEIVE: &str = "receive";
    pub const RECEIVE_ERROR: &str = "receive_error";
    pub const ACCEPT: &str = "accept";
    pub const TIMEOUT: &str = "timeout";
}

/// Receiver of transfer statistics
pub trait StatsSink: Send + Sync {
    /// Add `count` events carrying `bytes` bytes under `name`
    fn record(&self, name: &str, count: u64, bytes: u64);
}

/// Discards all statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record(&self, _name: &str, _count: u64, _bytes: u64) {}
}

/// Accumulated value of one statistic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatCounter {
    pub count: u64,
    pub bytes: u64,
}

/// In-memory accumulator keyed by statistic name
#[derive(Debug, Default)]
pub struct CounterStats {
    counters: DashMap<String, StatCounter>,
}

impl CounterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for `name`
    pub fn get(&self, name: &str) -> StatCounter {
        self.counters.get(name).map(|c| *c).unwrap_or_default()
    }

    /// Sorted copy of every counter
    pub fn snapshot(&self) -> BTreeMap<String, StatCounter> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl StatsSink for CounterStats {
    fn record(&self, name: &str, count: u64, bytes: u64) {
        let mut counter = self.counters.entry(name.to_string()).or_default();
        counter.count += count;
        counter.bytes += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let stats = CounterStats::new();
        stats.record(names::SEND, 1, 100);
        stats.record(names::SEND, 2, 50);
        stats.record(names::RECEIVE, 1, 7);

        assert_eq!(stats.get(names::SEND), StatCounter { count: 3, bytes: 150 });
        assert_eq!(stats.get("missing"), StatCounter::default());
        assert_eq!(stats.snapshot().len(), 2);
    }
}

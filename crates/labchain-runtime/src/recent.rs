//! Size- and age-capped map keyed by transaction hash.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    seq: u64,
    at: Instant,
}

/// Keeps at most `max_size` entries, none older than `ttl`. The oldest
/// entries go first.
pub(crate) struct RecentMap<V> {
    entries: HashMap<String, Entry<V>>,
    order: VecDeque<(String, u64)>,
    next_seq: u64,
    max_size: usize,
    ttl: Duration,
}

impl<V> RecentMap<V> {
    pub(crate) fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Insert or refresh `key`. Returns `false` if a live entry was replaced.
    pub(crate) fn insert(&mut self, key: &str, value: V) -> bool {
        let now = Instant::now();
        let fresh = !self.contains(key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key.to_string(), Entry { value, seq, at: now });
        self.order.push_back((key.to_string(), seq));
        self.prune(now);
        fresh
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.at.elapsed() < self.ttl)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        (entry.at.elapsed() < self.ttl).then_some(entry.value)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((key, seq)) = self.order.front() {
            let live = self.entries.get(key).filter(|entry| entry.seq == *seq);
            let expired = live.is_some_and(|entry| now.duration_since(entry.at) >= self.ttl);
            let over = self.entries.len() > self.max_size || self.order.len() > self.max_size * 2;
            if live.is_some() && !expired && !over {
                break;
            }
            if let Some((key, seq)) = self.order.pop_front() {
                if self.entries.get(&key).is_some_and(|entry| entry.seq == seq) {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

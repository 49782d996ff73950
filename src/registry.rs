//! TTL-bounded correlation table
//!
//! Broker and both agents track in-flight work in a [`Registry`]: each record is
//! keyed by the id its owner minted, carries an absolute deadline, and leaves the
//! table exactly once, either through [`Registry::take`] (a reply arrived) or through
//! [`Registry::expired`] (its deadline passed). Whichever path runs first wins; the
//! other finds nothing.
//!
//! The registry is owned by a single task, so take-and-remove is atomic by
//! construction: there is no window between checking for a record and deleting it.

use std::collections::HashMap;
use std::future::{pending, poll_fn};
use std::hash::Hash;
use std::time::Duration;
use tokio_util::time::delay_queue::{self, DelayQueue};

struct Entry<V> {
    record: V,
    timer: delay_queue::Key,
}

/// Correlation table with per-record deadlines
pub struct Registry<K, V> {
    entries: HashMap<K, Entry<V>>,
    timers: DelayQueue<K>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    /// Store `record` under `id`, expiring after `ttl`.
    ///
    /// A record already stored under `id` is replaced and its timer cancelled.
    pub fn put(&mut self, id: K, record: V, ttl: Duration) {
        self.remove(&id);
        let timer = self.timers.insert(id.clone(), ttl);
        self.entries.insert(id, Entry { record, timer });
    }

    /// Remove and return the record, cancelling its timer
    pub fn take(&mut self, id: &K) -> Option<V> {
        let entry = self.entries.remove(id)?;
        self.timers.remove(&entry.timer);
        Some(entry.record)
    }

    /// Remove the record on normal completion. Returns whether it was present.
    pub fn remove(&mut self, id: &K) -> bool {
        self.take(id).is_some()
    }

    pub fn get(&self, id: &K) -> Option<&V> {
        self.entries.get(id).map(|e| &e.record)
    }

    pub fn contains(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for the next record whose deadline passes, removing it.
    ///
    /// Pends forever while the table is empty; callers re-create this future on each
    /// pass of their event loop, so records added later are picked up.
    pub async fn expired(&mut self) -> (K, V) {
        loop {
            match poll_fn(|cx| self.timers.poll_expired(cx)).await {
                Some(expired) => {
                    let id = expired.into_inner();
                    if let Some(entry) = self.entries.remove(&id) {
                        return (id, entry.record);
                    }
                }
                None => pending::<()>().await,
            }
        }
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    const TTL: Duration = Duration::from_millis(10);

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_after_ttl() {
        let mut reg: Registry<String, &str> = Registry::new();
        reg.put("a".to_string(), "record", TTL);
        assert!(reg.contains(&"a".to_string()));

        let start = Instant::now();
        let (id, record) = reg.expired().await;
        assert_eq!(id, "a");
        assert_eq!(record, "record");
        assert!(start.elapsed() >= TTL);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_cancels_timer() {
        let mut reg: Registry<String, u32> = Registry::new();
        reg.put("a".to_string(), 1, TTL);

        assert_eq!(reg.take(&"a".to_string()), Some(1));
        assert_eq!(reg.take(&"a".to_string()), None);

        let fired = tokio::time::timeout(TTL * 5, reg.expired()).await;
        assert!(fired.is_err(), "cancelled record must not expire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_take_after_deadline_is_exactly_once() {
        let mut reg: Registry<String, u32> = Registry::new();
        reg.put("a".to_string(), 7, TTL);

        // The deadline passes but the owner handles a reply before its timer
        tokio::time::advance(TTL * 2).await;
        assert_eq!(reg.take(&"a".to_string()), Some(7));

        let fired = tokio::time::timeout(TTL, reg.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_order_follows_deadlines() {
        let mut reg: Registry<u32, &str> = Registry::new();
        reg.put(1, "slow", TTL * 3);
        reg.put(2, "fast", TTL);

        assert_eq!(reg.expired().await, (2, "fast"));
        assert_eq!(reg.expired().await, (1, "slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_replaces_existing_record() {
        let mut reg: Registry<u32, &str> = Registry::new();
        reg.put(1, "old", TTL);
        reg.put(1, "new", TTL * 4);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&1), Some(&"new"));

        let start = Instant::now();
        assert_eq!(reg.expired().await, (1, "new"));
        assert!(start.elapsed() >= TTL * 4);
    }
}

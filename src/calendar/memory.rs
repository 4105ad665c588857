/*!
 * Memory Tier
 *
 * A bounded, in-process `fingerprint -> CacheEntry` map with an LRU eviction
 * overlay and per-entry TTL. All operations are O(1) and take no I/O under
 * the lock, matching the concurrency model's requirement that the hot path
 * never blocks on disk while holding this mutex.
 */

use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::calendar::types::CacheEntry;

struct Inner {
    entries: LruCache<String, CacheEntry>,
    evictions: u64,
}

/// The in-memory hot tier of the two-tier event cache.
pub struct MemoryTier {
    inner: Mutex<Inner>,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(max_entries.max(1)).expect("max_entries clamped to at least 1");
        Self { inner: Mutex::new(Inner { entries: LruCache::new(capacity), evictions: 0 }) }
    }

    /// Returns the cached events for `fingerprint` if present and not
    /// expired. A hit bumps the entry's LRU recency; an expired entry is
    /// removed lazily on this access rather than left for the sweep.
    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let mut guard = self.inner.lock();
        let now = Instant::now();

        let is_expired = match guard.entries.get(fingerprint) {
            Some(entry) => entry.is_expired(now),
            None => return None,
        };

        if is_expired {
            guard.entries.pop(fingerprint);
            return None;
        }

        guard.entries.get(fingerprint).cloned()
    }

    /// Inserts or replaces the entry for `fingerprint`. If the table is at
    /// capacity, the LRU entry is evicted to make room.
    pub fn put(&self, fingerprint: String, entry: CacheEntry) {
        let mut guard = self.inner.lock();
        if guard.entries.len() == guard.entries.cap().get() && !guard.entries.contains(&fingerprint) {
            if guard.entries.pop_lru().is_some() {
                guard.evictions += 1;
            }
        }
        guard.entries.put(fingerprint, entry);
    }

    /// Drops every entry that references `source_id` in any of its events.
    pub fn invalidate_source(&self, source_id: &str) {
        let mut guard = self.inner.lock();
        let stale: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, entry)| entry.source_ids().any(|id| id == source_id))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();

        for fingerprint in stale {
            guard.entries.pop(&fingerprint);
        }
    }

    /// Sweeps out every expired entry; intended to run on a periodic timer
    /// so memory is reclaimed even for fingerprints nobody queries again.
    pub fn sweep_expired(&self) -> usize {
        let mut guard = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<String> =
            guard.entries.iter().filter(|(_, entry)| entry.is_expired(now)).map(|(fingerprint, _)| fingerprint.clone()).collect();

        for fingerprint in &stale {
            guard.entries.pop(fingerprint);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.entries.clear();
    }
}

pub fn entry(fingerprint: String, events: Vec<crate::calendar::types::NormalizedEvent>, ttl: Duration) -> CacheEntry {
    CacheEntry { fingerprint, events, inserted_at: Instant::now(), ttl }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::types::NormalizedEvent;
    use chrono::Utc;

    fn sample_event(source_id: &str) -> NormalizedEvent {
        NormalizedEvent {
            id: format!("{}:1", source_id),
            source_id: source_id.to_string(),
            title: "Event".to_string(),
            description: None,
            start_date: Utc::now(),
            end_date: Utc::now(),
            location: None,
            organizer: None,
            categories: vec![],
            url: None,
            last_modified: Utc::now(),
            recurrence: None,
        }
    }

    #[test]
    fn get_after_put_returns_entry() {
        let tier = MemoryTier::new(10);
        tier.put("fp1".to_string(), entry("fp1".to_string(), vec![sample_event("s1")], Duration::from_secs(60)));
        assert!(tier.get("fp1").is_some());
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let tier = MemoryTier::new(10);
        tier.put("fp1".to_string(), entry("fp1".to_string(), vec![sample_event("s1")], Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(tier.get("fp1").is_none());
    }

    #[test]
    fn capacity_overflow_evicts_lru() {
        let tier = MemoryTier::new(1);
        tier.put("fp1".to_string(), entry("fp1".to_string(), vec![sample_event("s1")], Duration::from_secs(60)));
        tier.put("fp2".to_string(), entry("fp2".to_string(), vec![sample_event("s1")], Duration::from_secs(60)));
        assert!(tier.get("fp1").is_none());
        assert!(tier.get("fp2").is_some());
        assert_eq!(tier.evictions(), 1);
    }

    #[test]
    fn invalidate_source_drops_matching_entries_only() {
        let tier = MemoryTier::new(10);
        tier.put("fp1".to_string(), entry("fp1".to_string(), vec![sample_event("s1")], Duration::from_secs(60)));
        tier.put("fp2".to_string(), entry("fp2".to_string(), vec![sample_event("s2")], Duration::from_secs(60)));

        tier.invalidate_source("s1");

        assert!(tier.get("fp1").is_none());
        assert!(tier.get("fp2").is_some());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let tier = MemoryTier::new(10);
        tier.put("fp1".to_string(), entry("fp1".to_string(), vec![sample_event("s1")], Duration::from_millis(0)));
        tier.put("fp2".to_string(), entry("fp2".to_string(), vec![sample_event("s1")], Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));

        let swept = tier.sweep_expired();
        assert_eq!(swept, 1);
        assert_eq!(tier.len(), 1);
    }
}

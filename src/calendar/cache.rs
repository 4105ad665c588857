/*!
 * EventCache
 *
 * Facade over the memory tier (C4) and the persistent event index (C3).
 * Reads consult memory first, then the persistent store, promoting a
 * persistent hit back into memory. Writes go to the persistent store first
 * (the durable source of truth) and only then populate memory, so a crash
 * mid-write never leaves memory holding events the disk doesn't have.
 */

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::calendar::database::PersistentEventIndex;
use crate::calendar::error::CalendarResult;
use crate::calendar::memory::{self, MemoryTier};
use crate::calendar::types::{CacheStats, NormalizedEvent, QueryDescriptor};

pub struct EventCache {
    memory: Arc<MemoryTier>,
    persistent: Arc<PersistentEventIndex>,
    memory_ttl: Duration,
    persistent_ttl_seconds: u64,
    stats: AsyncMutex<CacheStats>,
    sweep_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl EventCache {
    pub fn new(
        persistent: Arc<PersistentEventIndex>,
        max_memory_entries: usize,
        memory_ttl: Duration,
        persistent_ttl_seconds: u64,
    ) -> Self {
        Self {
            memory: Arc::new(MemoryTier::new(max_memory_entries)),
            persistent,
            memory_ttl,
            persistent_ttl_seconds,
            stats: AsyncMutex::new(CacheStats::default()),
            sweep_handle: AsyncMutex::new(None),
        }
    }

    /// Starts the background sweep task that periodically clears expired
    /// memory-tier entries and persistent query-cache rows. Calling this
    /// twice without an intervening `close()` replaces the previous task.
    pub async fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = cache.memory.sweep_expired();
                if swept > 0 {
                    debug!(swept, "memory tier sweep removed expired entries");
                }
                if let Err(e) = cache.persistent.cleanup_expired().await {
                    warn!("persistent query cache cleanup failed: {}", e);
                }
            }
        });
        *self.sweep_handle.lock().await = Some(handle);
    }

    /// Reads events matching `query`, consulting memory then the persistent
    /// tier. Never touches the network; a miss here is the caller's signal
    /// to dispatch a fetch.
    pub async fn get_events(&self, query: &QueryDescriptor) -> CalendarResult<Option<Vec<NormalizedEvent>>> {
        let fingerprint = query.fingerprint();

        if let Some(entry) = self.memory.get(&fingerprint) {
            self.stats.lock().await.memory_hits += 1;
            return Ok(Some(entry.events));
        }
        self.stats.lock().await.memory_misses += 1;

        if let Some(events) = self.persistent.find_by_fingerprint(&fingerprint).await? {
            self.stats.lock().await.persistent_hits += 1;
            self.memory.put(fingerprint.clone(), memory::entry(fingerprint, events.clone(), self.memory_ttl));
            return Ok(Some(events));
        }

        let events = self.persistent.find_by_query(query).await?;
        if events.is_empty() {
            self.stats.lock().await.persistent_misses += 1;
            return Ok(None);
        }

        self.stats.lock().await.persistent_hits += 1;
        self.memory.put(fingerprint.clone(), memory::entry(fingerprint, events.clone(), self.memory_ttl));
        Ok(Some(events))
    }

    /// Writes `events` through to the persistent tier, records the
    /// fingerprint's result set, and populates memory. Idempotent: calling
    /// twice with the same arguments leaves the cache in the same state.
    pub async fn set_events(&self, query: &QueryDescriptor, events: Vec<NormalizedEvent>) -> CalendarResult<()> {
        self.persistent.upsert_events(&events).await?;

        let fingerprint = query.fingerprint();
        let event_ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        self.persistent.record_query_result(&fingerprint, self.persistent_ttl_seconds, &event_ids).await?;

        self.stats.lock().await.total_events = events.len() as u64;
        self.memory.put(fingerprint.clone(), memory::entry(fingerprint, events, self.memory_ttl));
        Ok(())
    }

    /// Looks up a single event directly in the persistent tier by its
    /// `(source_id, event_id)` key, bypassing fingerprint matching entirely.
    pub async fn find_event_by_id(&self, source_id: &str, event_id: &str) -> CalendarResult<Option<NormalizedEvent>> {
        self.persistent.find_by_id(source_id, event_id).await
    }

    /// Removes every event and cached query result tied to `source_id` from
    /// both tiers.
    pub async fn invalidate_source(&self, source_id: &str) -> CalendarResult<()> {
        self.memory.invalidate_source(source_id);
        self.persistent.delete_by_source(source_id).await
    }

    pub async fn get_stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().await.clone();
        stats.evictions = self.memory.evictions();
        stats
    }

    /// Stops the sweep task and closes the persistent connection pool.
    pub async fn close(&self) {
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
        }
        self.persistent.close().await;
    }
}

/*!
 * CalendarManager - Aggregation Engine
 *
 * Orchestrates the Adapter Registry, the Fetch Coordinator, and the two-tier
 * EventCache: cache lookup, fan-out fetch on miss, normalize, deduplicate,
 * write back. Also owns source lifecycle (add/update/remove with cache
 * invalidation) and the status snapshot surface.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;
use tracing::warn;

use crate::calendar::cache::EventCache;
use crate::calendar::config::{CalendarConfig, ConfigListenerFn, ConfigListenerRegistry};
use crate::calendar::coordinator::{FetchCoordinator, RetryPolicy};
use crate::calendar::database::PersistentEventIndex;
use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::health::HealthMonitor;
use crate::calendar::providers::{self, AdapterRegistry};
use crate::calendar::status::{ListenerId, ServerStatus, StatusListenerFn, StatusListenerRegistry, StatusSnapshot};
use crate::calendar::types::{CalendarSource, DateRange, FetchResult, HealthStatus, NormalizedEvent, QueryDescriptor};

/// Outcome of [`CalendarManager::fetch_events`].
#[derive(Debug, Clone)]
pub struct FetchEventsOutcome {
    pub events: Vec<NormalizedEvent>,
    pub results: Vec<FetchResult>,
    pub errors: Vec<String>,
}

/// Outcome of [`CalendarManager::get_event_details`].
#[derive(Debug, Clone)]
pub struct EventDetailsOutcome {
    pub found: bool,
    pub event: Option<NormalizedEvent>,
    pub error: Option<String>,
}

pub struct CalendarManager {
    sources: RwLock<HashMap<String, CalendarSource>>,
    cache: Arc<EventCache>,
    coordinator: Arc<FetchCoordinator>,
    adapter_registry: Arc<AdapterRegistry>,
    status_listeners: StatusListenerRegistry,
    config_listeners: ConfigListenerRegistry,
    last_sync: SyncRwLock<HashMap<String, chrono::DateTime<Utc>>>,
    last_error: SyncRwLock<HashMap<String, String>>,
}

impl CalendarManager {
    pub async fn new(config: CalendarConfig, http_client: reqwest::Client) -> CalendarResult<Self> {
        config.validate()?;

        let persistent = Arc::new(PersistentEventIndex::connect(&config.database_url).await?);
        let cache = Arc::new(EventCache::new(
            persistent,
            config.cache.max_memory_events,
            Duration::from_secs(config.cache.memory_ttl_seconds),
            config.cache.persistent_ttl_seconds,
        ));
        cache.start_sweeper(Duration::from_secs(config.cache.cleanup_interval_seconds)).await;

        let adapter_registry = Arc::new(providers::default_registry(http_client).await);
        let coordinator = Arc::new(FetchCoordinator::new(
            Arc::clone(&adapter_registry),
            config.cache.max_concurrent_fetches,
            Duration::from_secs(config.cache.fetch_timeout_seconds),
            RetryPolicy { max_attempts: config.cache.max_retries.max(1), ..Default::default() },
        ));

        let sources = config.sources.iter().map(|s| (s.id.clone(), s.clone())).collect();

        Ok(Self {
            sources: RwLock::new(sources),
            cache,
            coordinator,
            adapter_registry,
            status_listeners: StatusListenerRegistry::new(),
            config_listeners: ConfigListenerRegistry::new(),
            last_sync: SyncRwLock::new(HashMap::new()),
            last_error: SyncRwLock::new(HashMap::new()),
        })
    }

    async fn resolve_sources(&self, source_ids: Option<&[String]>) -> Vec<CalendarSource> {
        let sources = self.sources.read().await;
        match source_ids {
            Some(ids) => ids.iter().filter_map(|id| sources.get(id)).filter(|s| s.enabled).cloned().collect(),
            None => {
                let mut all: Vec<CalendarSource> = sources.values().filter(|s| s.enabled).cloned().collect();
                all.sort_by(|a, b| a.id.cmp(&b.id));
                all
            }
        }
    }

    /// Consult the cache, fall back to a fan-out fetch on miss, deduplicate,
    /// and write back.
    pub async fn fetch_events(&self, date_range: Option<DateRange>, source_ids: Option<Vec<String>>) -> FetchEventsOutcome {
        let sources = self.resolve_sources(source_ids.as_deref()).await;
        if sources.is_empty() {
            return FetchEventsOutcome { events: vec![], results: vec![], errors: vec!["No enabled calendar sources available".to_string()] };
        }

        let query = QueryDescriptor { source_ids: Some(sources.iter().map(|s| s.id.clone()).collect()), date_range, keywords: None, categories: None };

        match self.cache.get_events(&query).await {
            Ok(Some(cached)) => {
                let results = sources
                    .iter()
                    .map(|s| FetchResult {
                        source_id: s.id.clone(),
                        success: true,
                        fetch_time_ms: 0,
                        error: None,
                        event_count: cached.iter().filter(|e| e.source_id == s.id).count(),
                    })
                    .collect();
                return FetchEventsOutcome { events: cached, results, errors: vec![] };
            }
            Ok(None) => {}
            Err(e) => warn!("cache read failed, falling back to a live fetch: {}", e),
        }

        let (fetched, results) = self.coordinator.fetch_all(&sources).await;
        let ordered_results = reorder_results(results, &sources);

        let errors: Vec<String> =
            ordered_results.iter().filter(|r| !r.success).map(|r| format!("{}: {}", r.source_id, r.error.clone().unwrap_or_default())).collect();

        let matched: Vec<NormalizedEvent> = fetched.into_iter().filter(|e| query.matches(e)).collect();
        let deduplicated = dedupe(matched);

        if let Err(e) = self.cache.set_events(&query, deduplicated.clone()).await {
            warn!("failed to write fetched events back to cache: {}", e);
        }

        self.record_sync(&ordered_results);
        self.notify_status().await;

        FetchEventsOutcome { events: deduplicated, results: ordered_results, errors }
    }

    /// Bypasses the cache read, invalidates the source, fetches, and writes
    /// back. Fails with `SourceNotFound` if `source_id` is unknown.
    pub async fn refresh_source(&self, source_id: &str, date_range: Option<DateRange>) -> CalendarResult<FetchResult> {
        let source = self.get_source(source_id).await.ok_or_else(|| CalendarError::SourceNotFound { source_id: source_id.to_string() })?;

        self.cache.invalidate_source(source_id).await?;

        let started = Instant::now();
        let result = match self.coordinator.fetch_one(&source).await {
            Ok(events) => {
                let query = QueryDescriptor {
                    source_ids: Some(std::iter::once(source_id.to_string()).collect()),
                    date_range,
                    keywords: None,
                    categories: None,
                };
                let matched: Vec<NormalizedEvent> = events.into_iter().filter(|e| query.matches(e)).collect();
                let deduplicated = dedupe(matched);
                let count = deduplicated.len();
                if let Err(e) = self.cache.set_events(&query, deduplicated).await {
                    warn!("failed to write refreshed events back to cache: {}", e);
                }
                FetchResult { source_id: source_id.to_string(), success: true, fetch_time_ms: started.elapsed().as_millis() as u64, error: None, event_count: count }
            }
            Err(e) => {
                FetchResult { source_id: source_id.to_string(), success: false, fetch_time_ms: started.elapsed().as_millis() as u64, error: Some(e.to_string()), event_count: 0 }
            }
        };

        self.record_sync(std::slice::from_ref(&result));
        self.notify_status().await;
        Ok(result)
    }

    /// Looks the event up by id directly in the persistent index first
    /// (`"{sourceId}:{rawId}"`); on a miss, fans out to every enabled source
    /// and searches the normalized results.
    pub async fn get_event_details(&self, event_id: &str, _include_recurrence: bool) -> EventDetailsOutcome {
        if let Some((source_id, _)) = event_id.split_once(':') {
            match self.cache.find_event_by_id(source_id, event_id).await {
                Ok(Some(event)) => return EventDetailsOutcome { found: true, event: Some(event), error: None },
                Ok(None) => {}
                Err(e) => warn!("persistent lookup failed for {}: {}", event_id, e),
            }
        }

        let sources = self.resolve_sources(None).await;
        if sources.is_empty() {
            return EventDetailsOutcome { found: false, event: None, error: Some("No enabled calendar sources available".to_string()) };
        }

        let (events, results) = self.coordinator.fetch_all(&sources).await;

        if let Some(event) = events.into_iter().find(|e| e.id == event_id) {
            return EventDetailsOutcome { found: true, event: Some(event), error: None };
        }

        if let Some(error) = results.iter().find(|r| !r.success).and_then(|r| r.error.clone()) {
            return EventDetailsOutcome { found: false, event: None, error: Some(error) };
        }

        EventDetailsOutcome { found: false, event: None, error: Some(format!("Event '{}' not found in any configured calendar sources", event_id)) }
    }

    pub async fn add_source(&self, source: CalendarSource) -> CalendarResult<()> {
        self.sources.write().await.insert(source.id.clone(), source);
        Ok(())
    }

    pub async fn update_source(&self, source: CalendarSource) -> CalendarResult<()> {
        let source_id = source.id.clone();
        {
            let mut sources = self.sources.write().await;
            if !sources.contains_key(&source_id) {
                return Err(CalendarError::SourceNotFound { source_id });
            }
            sources.insert(source.id.clone(), source);
        }
        self.cache.invalidate_source(&source_id).await
    }

    pub async fn remove_source(&self, source_id: &str) -> CalendarResult<()> {
        {
            let mut sources = self.sources.write().await;
            if sources.remove(source_id).is_none() {
                return Err(CalendarError::SourceNotFound { source_id: source_id.to_string() });
            }
        }
        self.cache.invalidate_source(source_id).await
    }

    pub async fn get_source(&self, source_id: &str) -> Option<CalendarSource> {
        self.sources.read().await.get(source_id).cloned()
    }

    pub async fn get_sources(&self) -> Vec<CalendarSource> {
        self.sources.read().await.values().cloned().collect()
    }

    /// Looks up the adapter for `source.source_type` and runs its
    /// validation. An adapter error is not propagated; it yields `false`.
    pub async fn validate_source(&self, source: &CalendarSource) -> CalendarResult<bool> {
        let adapter = self.adapter_registry.get(source.source_type).await?;
        Ok(adapter.validate_source(source).await.is_ok())
    }

    fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(Arc::clone(&self.adapter_registry), self.coordinator.semaphore())
    }

    pub async fn get_source_health(&self, source_id: &str) -> Option<HealthStatus> {
        let source = self.get_source(source_id).await?;
        self.health_monitor().get_source_health(&source).await
    }

    pub async fn get_sources_health(&self) -> Vec<HealthStatus> {
        let sources = self.resolve_sources(None).await;
        self.health_monitor().get_sources_health(&sources).await
    }

    pub fn add_status_listener(&self, listener: StatusListenerFn) -> ListenerId {
        self.status_listeners.add_listener(listener)
    }

    pub fn remove_status_listener(&self, id: ListenerId) {
        self.status_listeners.remove_listener(id)
    }

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let sources: Vec<CalendarSource> = self.sources.read().await.values().cloned().collect();
        let last_sync = self.last_sync.read().clone();
        let last_error = self.last_error.read().clone();
        StatusSnapshot::build(ServerStatus::Running, &sources, &last_sync, &last_error)
    }

    async fn notify_status(&self) {
        let snapshot = self.status_snapshot().await;
        self.status_listeners.notify(&snapshot);
    }

    fn record_sync(&self, results: &[FetchResult]) {
        let now = Utc::now();
        let mut last_sync = self.last_sync.write();
        let mut last_error = self.last_error.write();
        for result in results {
            if result.success {
                last_sync.insert(result.source_id.clone(), now);
                last_error.remove(&result.source_id);
            } else if let Some(error) = &result.error {
                last_error.insert(result.source_id.clone(), error.clone());
            }
        }
    }

    /// Hook point an external config loader drives when it observes a
    /// reload; this crate does not watch files itself.
    pub fn add_config_listener(&self, listener: ConfigListenerFn) {
        self.config_listeners.add_listener(listener);
    }

    pub fn notify_config_reload(&self, config: &CalendarConfig) {
        self.config_listeners.notify(config);
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }
}

/// Restores the per-source ordering of `sourceIds` (or registry order for
/// the default-all case) since the Fetch Coordinator completes in arbitrary
/// order. Any result that can't be matched to a requested source (e.g. a
/// panicked task reporting `"unknown"`) is appended rather than dropped.
fn reorder_results(results: Vec<FetchResult>, sources: &[CalendarSource]) -> Vec<FetchResult> {
    let mut by_id: HashMap<String, FetchResult> = HashMap::new();
    let mut leftovers = Vec::new();

    for result in results {
        if sources.iter().any(|s| s.id == result.source_id) {
            by_id.insert(result.source_id.clone(), result);
        } else {
            leftovers.push(result);
        }
    }

    let mut ordered: Vec<FetchResult> = sources.iter().filter_map(|s| by_id.remove(&s.id)).collect();
    ordered.extend(leftovers);
    ordered
}

/// Groups events by the duplicate key of spec §4.6.1 (title/start/end/
/// location.name, normalized) and keeps the best candidate per group.
fn dedupe(events: Vec<NormalizedEvent>) -> Vec<NormalizedEvent> {
    use std::collections::hash_map::Entry;

    let mut groups: HashMap<(String, i64, i64, Option<String>), NormalizedEvent> = HashMap::new();

    for event in events {
        let key = (
            event.title.trim().to_lowercase(),
            event.start_date.timestamp_nanos_opt().unwrap_or_default(),
            event.end_date.timestamp_nanos_opt().unwrap_or_default(),
            event.location.as_ref().map(|l| l.name.trim().to_lowercase()),
        );

        match groups.entry(key) {
            Entry::Occupied(mut slot) => {
                if is_preferred(&event, slot.get()) {
                    slot.insert(event);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
    }

    let mut result: Vec<NormalizedEvent> = groups.into_values().collect();
    result.sort_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id)));
    result
}

/// `candidate` wins over `current` iff it has a strictly greater
/// `last_modified`, or ties and wins the `sourceId` then `id` tie-break.
fn is_preferred(candidate: &NormalizedEvent, current: &NormalizedEvent) -> bool {
    use std::cmp::Ordering;

    match candidate.last_modified.cmp(&current.last_modified) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match candidate.source_id.cmp(&current.source_id) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => candidate.id < current.id,
        },
    }
}

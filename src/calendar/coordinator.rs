/*!
 * Fetch Coordinator
 *
 * Dispatches one fetch per source concurrently, bounded by a semaphore so a
 * large source list never opens unbounded outbound connections at once.
 * Each dispatch is wrapped in a timeout and an exponential-backoff retry
 * loop; a source that errors out never aborts its siblings, since every
 * dispatch runs in its own spawned task and failures are captured as data.
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, warn};

use crate::calendar::error::CalendarError;
use crate::calendar::providers::AdapterRegistry;
use crate::calendar::types::{CalendarSource, FetchResult, NormalizedEvent, RawEvent};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(10), backoff_multiplier: 2.0 }
    }
}

pub struct FetchCoordinator {
    registry: Arc<AdapterRegistry>,
    semaphore: Arc<tokio::sync::Semaphore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl FetchCoordinator {
    pub fn new(registry: Arc<AdapterRegistry>, max_concurrent_fetches: usize, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { registry, semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent_fetches.max(1))), timeout, retry }
    }

    /// The concurrency-limit semaphore, shared with the Health Monitor so
    /// health probes and event fetches draw from the same budget.
    pub fn semaphore(&self) -> Arc<tokio::sync::Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub fn adapter_registry(&self) -> Arc<AdapterRegistry> {
        Arc::clone(&self.registry)
    }

    /// Fetches and normalizes events from every source in `sources`,
    /// dispatching with bounded concurrency. Returns one `FetchResult` per
    /// source (in arbitrary completion order) alongside the events the
    /// successful fetches produced; a failing source contributes no events
    /// but never prevents the rest from completing.
    pub async fn fetch_all(&self, sources: &[CalendarSource]) -> (Vec<NormalizedEvent>, Vec<FetchResult>) {
        let mut tasks = Vec::with_capacity(sources.len());

        for source in sources {
            if !source.enabled {
                continue;
            }
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => continue,
            };
            let registry = Arc::clone(&self.registry);
            let source = source.clone();
            let timeout = self.timeout;
            let retry = self.retry.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                fetch_one(&registry, &source, timeout, &retry).await
            }));
        }

        let mut events = Vec::new();
        let mut results = Vec::with_capacity(tasks.len());

        for task in tasks {
            match task.await {
                Ok((source_id, outcome)) => {
                    match outcome {
                        Ok((fetched, elapsed)) => {
                            let count = fetched.len();
                            events.extend(fetched);
                            results.push(FetchResult { source_id, success: true, fetch_time_ms: elapsed, error: None, event_count: count });
                        }
                        Err((e, elapsed)) => {
                            warn!(source_id = %source_id, "fetch failed: {}", e);
                            results.push(FetchResult {
                                source_id,
                                success: false,
                                fetch_time_ms: elapsed,
                                error: Some(e.to_string()),
                                event_count: 0,
                            });
                        }
                    }
                }
                Err(e) => {
                    error!("fetch task panicked: {}", e);
                    results.push(FetchResult {
                        source_id: "unknown".to_string(),
                        success: false,
                        fetch_time_ms: 0,
                        error: Some(format!("task execution failed: {}", e)),
                        event_count: 0,
                    });
                }
            }
        }

        (events, results)
    }

    /// Fetches and normalizes a single source, used by on-demand refresh.
    pub async fn fetch_one(&self, source: &CalendarSource) -> Result<Vec<NormalizedEvent>, CalendarError> {
        let (_source_id, outcome) = fetch_one(&self.registry, source, self.timeout, &self.retry).await;
        outcome.map(|(events, _)| events).map_err(|(e, _)| e)
    }
}

async fn fetch_one(
    registry: &AdapterRegistry,
    source: &CalendarSource,
    timeout: Duration,
    retry: &RetryPolicy,
) -> (String, Result<(Vec<NormalizedEvent>, u64), (CalendarError, u64)>) {
    let started = Instant::now();
    let outcome = fetch_with_retry(registry, source, timeout, retry).await;
    let elapsed = started.elapsed().as_millis() as u64;
    (source.id.clone(), outcome.map(|events| (events, elapsed)).map_err(|e| (e, elapsed)))
}

async fn fetch_with_retry(
    registry: &AdapterRegistry,
    source: &CalendarSource,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<Vec<NormalizedEvent>, CalendarError> {
    let adapter = registry.get(source.source_type).await?;

    let mut attempt = 0;
    let mut delay = retry.base_delay;

    loop {
        attempt += 1;

        let attempt_result = match tokio::time::timeout(timeout, adapter.fetch_events(source)).await {
            Ok(result) => result,
            Err(_) => Err(CalendarError::timeout(source.id.clone(), timeout)),
        };

        match attempt_result {
            Ok(raw_events) => return Ok(normalize_all(adapter.as_ref(), source, raw_events)),
            Err(e) if attempt >= retry.max_attempts => return Err(e),
            Err(e) if e.is_retryable() => {
                warn!(source_id = %source.id, attempt, "fetch attempt failed, retrying in {:?}: {}", delay, e);
                tokio::time::sleep(delay).await;
                let next = std::cmp::min(Duration::from_millis((delay.as_millis() as f32 * retry.backoff_multiplier) as u64), retry.max_delay);
                let jitter = 1.0 + rand::thread_rng().gen_range(-0.2..=0.2_f32);
                delay = Duration::from_millis(((next.as_millis() as f32) * jitter).max(0.0) as u64);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Normalizes every raw event, dropping (and logging) any that fail rather
/// than discarding the whole source's fetch over one bad event.
fn normalize_all(adapter: &dyn crate::calendar::providers::Adapter, source: &CalendarSource, raw_events: Vec<RawEvent>) -> Vec<NormalizedEvent> {
    let mut normalized = Vec::with_capacity(raw_events.len());
    for raw in raw_events {
        let raw_id = raw.id.clone();
        match adapter.normalize_event(source, raw) {
            Ok(event) => normalized.push(event),
            Err(e) => warn!(source_id = %source.id, event_id = %raw_id, "dropping event that failed normalization: {}", e),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::providers::Adapter;
    use crate::calendar::types::{HealthStatus, SourceType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAdapter {
        calls: AtomicUsize,
        fail_until: usize,
    }

    #[async_trait]
    impl Adapter for FlakyAdapter {
        fn supported_type(&self) -> SourceType {
            SourceType::Ical
        }

        async fn fetch_events(&self, source: &CalendarSource) -> Result<Vec<RawEvent>, CalendarError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_until {
                return Err(CalendarError::network(source.id.clone(), "transient failure"));
            }
            Ok(vec![RawEvent { id: "e1".to_string(), payload: serde_json::json!({"summary": "Ok", "dtstart": "20240115T090000Z"}) }])
        }

        fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> Result<NormalizedEvent, CalendarError> {
            Ok(stub_event(source, &raw.id))
        }

        async fn validate_source(&self, _source: &CalendarSource) -> Result<(), CalendarError> {
            Ok(())
        }

        async fn get_source_status(&self, source: &CalendarSource) -> Result<HealthStatus, CalendarError> {
            Ok(HealthStatus { source_id: source.id.clone(), is_healthy: true, last_check: chrono::Utc::now(), response_time_ms: Some(0), error_message: None })
        }
    }

    fn stub_event(source: &CalendarSource, raw_id: &str) -> NormalizedEvent {
        let start = chrono::DateTime::parse_from_rfc3339("2024-01-15T09:00:00Z").unwrap().with_timezone(&chrono::Utc);
        NormalizedEvent {
            id: format!("{}:{}", source.id, raw_id),
            source_id: source.id.clone(),
            title: "Ok".to_string(),
            description: None,
            start_date: start,
            end_date: start + chrono::Duration::hours(1),
            location: None,
            organizer: None,
            categories: vec![],
            url: None,
            last_modified: chrono::Utc::now(),
            recurrence: None,
        }
    }

    struct AlwaysFailsAdapter;

    #[async_trait]
    impl Adapter for AlwaysFailsAdapter {
        fn supported_type(&self) -> SourceType {
            SourceType::CalDav
        }

        async fn fetch_events(&self, source: &CalendarSource) -> Result<Vec<RawEvent>, CalendarError> {
            Err(CalendarError::ProtocolError { message: "always broken".to_string(), source_id: source.id.clone() })
        }

        fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> Result<NormalizedEvent, CalendarError> {
            Ok(stub_event(source, &raw.id))
        }

        async fn validate_source(&self, _source: &CalendarSource) -> Result<(), CalendarError> {
            Ok(())
        }

        async fn get_source_status(&self, source: &CalendarSource) -> Result<HealthStatus, CalendarError> {
            Ok(HealthStatus { source_id: source.id.clone(), is_healthy: false, last_check: chrono::Utc::now(), response_time_ms: Some(0), error_message: Some("broken".to_string()) })
        }
    }

    async fn registry_with(ical: Arc<dyn Adapter>, caldav: Arc<dyn Adapter>) -> Arc<AdapterRegistry> {
        let registry = AdapterRegistry::new();
        registry.register(ical).await;
        registry.register(caldav).await;
        Arc::new(registry)
    }

    #[tokio::test]
    async fn succeeds_after_retrying_a_flaky_source() {
        let registry = registry_with(
            Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_until: 1 }),
            Arc::new(AlwaysFailsAdapter),
        )
        .await;
        let coordinator = FetchCoordinator::new(registry, 4, Duration::from_secs(1), RetryPolicy { base_delay: Duration::from_millis(1), ..Default::default() });

        let source = CalendarSource::new("s1", "Flaky", SourceType::Ical, "https://example.com/cal.ics");
        let events = coordinator.fetch_one(&source).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn partial_failure_isolates_errors_per_source() {
        let registry = registry_with(
            Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_until: 0 }),
            Arc::new(AlwaysFailsAdapter),
        )
        .await;
        let coordinator = FetchCoordinator::new(registry, 4, Duration::from_secs(1), RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 1, ..Default::default() });

        let sources = vec![
            CalendarSource::new("good", "Good", SourceType::Ical, "https://example.com/good.ics"),
            CalendarSource::new("bad", "Bad", SourceType::CalDav, "https://example.com/bad"),
        ];

        let (events, results) = coordinator.fetch_all(&sources).await;
        assert_eq!(events.len(), 1);
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);
        assert_eq!(results.iter().filter(|r| !r.success).count(), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_error() {
        let registry = registry_with(
            Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), fail_until: 99 }),
            Arc::new(AlwaysFailsAdapter),
        )
        .await;
        let coordinator = FetchCoordinator::new(registry, 4, Duration::from_secs(1), RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 2, ..Default::default() });

        let source = CalendarSource::new("s1", "Flaky", SourceType::Ical, "https://example.com/cal.ics");
        let err = coordinator.fetch_one(&source).await.unwrap_err();
        assert!(matches!(err, CalendarError::NetworkError { .. }));
    }

    struct ConcurrencyTrackingAdapter {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Adapter for ConcurrencyTrackingAdapter {
        fn supported_type(&self) -> SourceType {
            SourceType::Ical
        }

        async fn fetch_events(&self, source: &CalendarSource) -> Result<Vec<RawEvent>, CalendarError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![RawEvent { id: "e1".to_string(), payload: serde_json::json!({}) }])
        }

        fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> Result<NormalizedEvent, CalendarError> {
            Ok(stub_event(source, &raw.id))
        }

        async fn validate_source(&self, _source: &CalendarSource) -> Result<(), CalendarError> {
            Ok(())
        }

        async fn get_source_status(&self, source: &CalendarSource) -> Result<HealthStatus, CalendarError> {
            Ok(HealthStatus { source_id: source.id.clone(), is_healthy: true, last_check: chrono::Utc::now(), response_time_ms: Some(0), error_message: None })
        }
    }

    #[tokio::test]
    async fn in_flight_fetches_never_exceed_the_concurrency_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let adapter: Arc<dyn Adapter> = Arc::new(ConcurrencyTrackingAdapter { in_flight: Arc::clone(&in_flight), peak: Arc::clone(&peak) });

        let registry = AdapterRegistry::new();
        registry.register(adapter).await;
        let registry = Arc::new(registry);

        let max_concurrent_fetches = 2;
        let coordinator = FetchCoordinator::new(
            registry,
            max_concurrent_fetches,
            Duration::from_secs(1),
            RetryPolicy { base_delay: Duration::from_millis(1), ..Default::default() },
        );

        let sources: Vec<CalendarSource> =
            (0..8).map(|i| CalendarSource::new(format!("s{}", i), "Source", SourceType::Ical, "https://example.com/cal.ics")).collect();

        coordinator.fetch_all(&sources).await;

        assert!(peak.load(Ordering::SeqCst) <= max_concurrent_fetches);
    }

    struct SlowAdapter;

    #[async_trait]
    impl Adapter for SlowAdapter {
        fn supported_type(&self) -> SourceType {
            SourceType::Ical
        }

        async fn fetch_events(&self, _source: &CalendarSource) -> Result<Vec<RawEvent>, CalendarError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![])
        }

        fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> Result<NormalizedEvent, CalendarError> {
            Ok(stub_event(source, &raw.id))
        }

        async fn validate_source(&self, _source: &CalendarSource) -> Result<(), CalendarError> {
            Ok(())
        }

        async fn get_source_status(&self, source: &CalendarSource) -> Result<HealthStatus, CalendarError> {
            Ok(HealthStatus { source_id: source.id.clone(), is_healthy: true, last_check: chrono::Utc::now(), response_time_ms: Some(0), error_message: None })
        }
    }

    #[tokio::test]
    async fn a_source_that_sleeps_past_the_timeout_surfaces_a_timeout_error() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(SlowAdapter) as Arc<dyn Adapter>).await;
        let registry = Arc::new(registry);

        let coordinator = FetchCoordinator::new(
            registry,
            4,
            Duration::from_millis(20),
            RetryPolicy { base_delay: Duration::from_millis(1), max_attempts: 1, ..Default::default() },
        );

        let source = CalendarSource::new("s1", "Slow", SourceType::Ical, "https://example.com/cal.ics");
        let err = coordinator.fetch_one(&source).await.unwrap_err();
        assert!(err.to_string().to_lowercase().contains("timeout"));
    }
}

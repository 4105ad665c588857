/*!
 * Health Monitor
 *
 * Per-source reachability probes, dispatched under the same concurrency
 * budget the Fetch Coordinator uses so a health sweep never competes
 * unboundedly with an in-flight `fetchEvents` for outbound connections.
 */

use std::sync::Arc;

use crate::calendar::providers::AdapterRegistry;
use crate::calendar::types::{CalendarSource, HealthStatus};

pub struct HealthMonitor {
    registry: Arc<AdapterRegistry>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AdapterRegistry>, semaphore: Arc<tokio::sync::Semaphore>) -> Self {
        Self { registry, semaphore }
    }

    /// Probes one source. Returns `None` only when the caller passes a
    /// source whose type has no registered adapter; callers typically
    /// resolve `source_id` to a `CalendarSource` first and skip this case.
    pub async fn get_source_health(&self, source: &CalendarSource) -> Option<HealthStatus> {
        let _permit = self.semaphore.acquire().await.ok()?;
        let adapter = self.registry.get(source.source_type).await.ok()?;
        adapter.get_source_status(source).await.ok()
    }

    /// Probes every enabled source concurrently, under the shared
    /// concurrency limit.
    pub async fn get_sources_health(&self, sources: &[CalendarSource]) -> Vec<HealthStatus> {
        let mut tasks = Vec::with_capacity(sources.len());

        for source in sources.iter().filter(|s| s.enabled) {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => continue,
            };
            let registry = Arc::clone(&self.registry);
            let source = source.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                match registry.get(source.source_type).await {
                    Ok(adapter) => adapter.get_source_status(&source).await.ok(),
                    Err(_) => None,
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Ok(Some(status)) = task.await {
                results.push(status);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::providers::Adapter;
    use crate::calendar::types::{NormalizedEvent, RawEvent, SourceType};
    use async_trait::async_trait;
    use chrono::Utc;

    struct AlwaysHealthyAdapter;

    #[async_trait]
    impl Adapter for AlwaysHealthyAdapter {
        fn supported_type(&self) -> SourceType {
            SourceType::Ical
        }

        async fn fetch_events(&self, _source: &CalendarSource) -> crate::calendar::error::CalendarResult<Vec<RawEvent>> {
            Ok(vec![])
        }

        fn normalize_event(&self, _source: &CalendarSource, _raw: RawEvent) -> crate::calendar::error::CalendarResult<NormalizedEvent> {
            unreachable!("not exercised in this test")
        }

        async fn validate_source(&self, _source: &CalendarSource) -> crate::calendar::error::CalendarResult<()> {
            Ok(())
        }

        async fn get_source_status(&self, source: &CalendarSource) -> crate::calendar::error::CalendarResult<HealthStatus> {
            Ok(HealthStatus { source_id: source.id.clone(), is_healthy: true, last_check: Utc::now(), response_time_ms: Some(5), error_message: None })
        }
    }

    #[tokio::test]
    async fn probes_every_enabled_source() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(AlwaysHealthyAdapter)).await;
        let monitor = HealthMonitor::new(Arc::new(registry), Arc::new(tokio::sync::Semaphore::new(4)));

        let sources = vec![
            CalendarSource::new("s1", "One", SourceType::Ical, "https://example.com/1.ics"),
            CalendarSource::new("s2", "Two", SourceType::Ical, "https://example.com/2.ics"),
        ];

        let results = monitor.get_sources_health(&sources).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_healthy));
    }

    #[tokio::test]
    async fn unregistered_type_yields_none() {
        let registry = Arc::new(AdapterRegistry::new());
        let monitor = HealthMonitor::new(registry, Arc::new(tokio::sync::Semaphore::new(4)));
        let source = CalendarSource::new("s1", "One", SourceType::CalDav, "https://example.com/1");
        assert!(monitor.get_source_health(&source).await.is_none());
    }
}

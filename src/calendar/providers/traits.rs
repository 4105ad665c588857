/*!
 * Adapter Contract
 *
 * The single trait every source adapter implements. An adapter knows how to
 * talk to exactly one protocol; the aggregation engine never depends on a
 * concrete adapter type, only on this trait through the registry.
 */

use async_trait::async_trait;

use crate::calendar::error::CalendarResult;
use crate::calendar::types::{CalendarSource, HealthStatus, NormalizedEvent, RawEvent, SourceType};

/// A connector to one external calendar source protocol.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The source type this adapter handles. Used as the registry key.
    fn supported_type(&self) -> SourceType;

    /// Fetch raw events from the source. Adapters do not filter or
    /// deduplicate; that is the Fetch Coordinator's and CalendarManager's
    /// job.
    async fn fetch_events(&self, source: &CalendarSource) -> CalendarResult<Vec<RawEvent>>;

    /// Convert one raw event into the canonical shape. A single malformed
    /// event should return `NormalizationError`, not abort the whole fetch;
    /// callers drop individual normalization failures and continue.
    fn normalize_event(&self, source: &CalendarSource, raw: RawEvent) -> CalendarResult<NormalizedEvent>;

    /// Check that `source`'s configuration is reachable and well-formed
    /// without importing a full fetch (e.g. `addSource`/`updateSource`
    /// validation).
    async fn validate_source(&self, source: &CalendarSource) -> CalendarResult<()>;

    /// Lightweight reachability probe used by the Health Monitor.
    async fn get_source_status(&self, source: &CalendarSource) -> CalendarResult<HealthStatus>;
}

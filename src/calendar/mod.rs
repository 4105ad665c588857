/*!
 * Calendar Aggregator
 *
 * Pulls events from multiple heterogeneous calendar sources (iCal feeds,
 * CalDAV servers) through a registry of adapters, fans the fetch out under
 * a bounded concurrency budget with per-source timeout and retry, dedupes
 * across sources, and serves the merged result from a two-tier cache. See
 * [`engine::CalendarManager`] for the entry point.
 */

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod datetime;
pub mod engine;
pub mod error;
pub mod health;
pub mod memory;
pub mod providers;
pub mod status;
pub mod types;

pub use config::{CacheConfig, CalendarConfig, ConfigListenerFn, ConfigListenerRegistry, ServerConfig};
pub use engine::{CalendarManager, EventDetailsOutcome, FetchEventsOutcome};
pub use error::{CalendarError, CalendarResult, ErrorSeverity};
pub use health::HealthMonitor;
pub use providers::{Adapter, AdapterRegistry};
pub use status::{ListenerId, ServerStatus, SourceStatusEntry, StatusListenerFn, StatusListenerRegistry, StatusSnapshot};
pub use types::{
    CacheEntry, CacheStats, CalendarSource, DateRange, EventLocation, EventOrganizer, FetchResult, HealthStatus,
    NormalizedEvent, QueryDescriptor, RawEvent, SourceStatus, SourceType,
};

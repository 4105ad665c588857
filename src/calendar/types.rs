/*!
 * Calendar Data Model
 *
 * The canonical types shared by the adapter contract, the two-tier event
 * cache, and the aggregation engine: `CalendarSource`, `NormalizedEvent`,
 * `RawEvent`, `QueryDescriptor`/`QueryFingerprint`, `CacheEntry`,
 * `CacheStats`, `HealthStatus` and `FetchResult`.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The closed set of source types a registered adapter may handle. Open to
/// future variants, as the registry keys on this tag rather than hard-coding
/// a match over every known protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Ical,
    CalDav,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Ical => write!(f, "ical"),
            SourceType::CalDav => write!(f, "caldav"),
        }
    }
}

/// Lifecycle status of a configured source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Error,
    Disabled,
}

/// A configured external calendar feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub url: String,
    pub enabled: bool,
    pub refresh_interval: Option<u64>,
    pub status: SourceStatus,
    /// Opaque credential blob; only the adapter for `source_type` interprets it.
    #[serde(default)]
    pub credentials: serde_json::Value,
}

impl CalendarSource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source_type: SourceType, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_type,
            url: url.into(),
            enabled: true,
            refresh_interval: None,
            status: SourceStatus::Active,
            credentials: serde_json::Value::Null,
        }
    }
}

/// A named location on an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventLocation {
    pub name: String,
    pub address: Option<String>,
}

/// Organizer contact for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventOrganizer {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Adapter-specific shape before normalization. The core treats this
/// opaquely; only the adapter that produced it interprets the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Adapter-local identifier, unique within the source.
    pub id: String,
    pub payload: serde_json::Value,
}

/// The canonical event shape every adapter normalizes into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Unique within `source_id`; conventionally `"{source_id}:{raw.id}"`.
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub location: Option<EventLocation>,
    pub organizer: Option<EventOrganizer>,
    /// Ordered set of category labels; order is preserved as supplied.
    #[serde(default)]
    pub categories: Vec<String>,
    pub url: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Carried opaquely; expansion is not a core responsibility (spec.md §9).
    pub recurrence: Option<serde_json::Value>,
}

impl NormalizedEvent {
    /// An event is all-day if the start has no time-of-day component, or if
    /// start and end are both exact midnight instants exactly 24h apart
    /// (spec.md §6).
    pub fn is_all_day(&self) -> bool {
        use chrono::Timelike;
        let midnight = |dt: &DateTime<Utc>| dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0;
        midnight(&self.start_date) && midnight(&self.end_date) && (self.end_date - self.start_date) == chrono::Duration::hours(24)
    }

    fn normalized_title(&self) -> String {
        self.title.trim().to_lowercase()
    }

    fn normalized_location_name(&self) -> Option<String> {
        self.location.as_ref().map(|l| l.name.trim().to_lowercase())
    }

    /// Two events are duplicates iff title/start/end/location.name all match
    /// per the rules of spec.md §4.6.1.
    pub fn is_duplicate_of(&self, other: &NormalizedEvent) -> bool {
        self.normalized_title() == other.normalized_title()
            && self.start_date == other.start_date
            && self.end_date == other.end_date
            && self.normalized_location_name() == other.normalized_location_name()
    }
}

/// AND-combined filter over cached events. An empty descriptor matches
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub source_ids: Option<BTreeSet<String>>,
    pub date_range: Option<DateRange>,
    pub keywords: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryDescriptor {
    /// Deterministic canonical string: sort `source_ids` lexicographically,
    /// normalize `date_range` to ISO instants, sort `keywords`/`categories`
    /// (spec.md §3 `QueryFingerprint`).
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::new();

        if let Some(ids) = &self.source_ids {
            let mut sorted: Vec<&String> = ids.iter().collect();
            sorted.sort();
            parts.push(format!("src={}", sorted.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")));
        } else {
            parts.push("src=*".to_string());
        }

        if let Some(range) = &self.date_range {
            parts.push(format!("range={}..{}", range.start.to_rfc3339(), range.end.to_rfc3339()));
        } else {
            parts.push("range=*".to_string());
        }

        if let Some(keywords) = &self.keywords {
            let mut sorted: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
            sorted.sort();
            parts.push(format!("kw={}", sorted.join(",")));
        } else {
            parts.push("kw=*".to_string());
        }

        if let Some(categories) = &self.categories {
            let mut sorted = categories.clone();
            sorted.sort();
            parts.push(format!("cat={}", sorted.join(",")));
        } else {
            parts.push("cat=*".to_string());
        }

        parts.join("|")
    }

    /// Whether `event` satisfies every predicate in this descriptor.
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        if let Some(ids) = &self.source_ids {
            if !ids.contains(&event.source_id) {
                return false;
            }
        }

        if let Some(range) = &self.date_range {
            if event.end_date < range.start || event.start_date > range.end {
                return false;
            }
        }

        if let Some(keywords) = &self.keywords {
            let haystack = format!(
                "{} {}",
                event.title.to_lowercase(),
                event.description.as_deref().unwrap_or("").to_lowercase()
            );
            if !keywords.iter().all(|kw| haystack.contains(&kw.to_lowercase())) {
                return false;
            }
        }

        if let Some(categories) = &self.categories {
            if !categories.iter().all(|c| event.categories.iter().any(|ec| ec.eq_ignore_ascii_case(c))) {
                return false;
            }
        }

        true
    }
}

/// An entry held by the in-memory hot tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub events: Vec<NormalizedEvent>,
    pub inserted_at: std::time::Instant,
    pub ttl: std::time::Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: std::time::Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.source_id.as_str())
    }
}

/// Cumulative counters for both cache tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub persistent_hits: u64,
    pub persistent_misses: u64,
    pub total_events: u64,
    pub evictions: u64,
}

/// Result of probing a single source's health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub source_id: String,
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// Per-source outcome of a Fetch Coordinator dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub source_id: String,
    pub success: bool,
    /// Wall-clock fetch time in milliseconds; `0` signals "served from cache".
    pub fetch_time_ms: u64,
    pub error: Option<String>,
    pub event_count: usize,
}

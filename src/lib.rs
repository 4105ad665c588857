//! Calendar Aggregator
//!
//! Aggregates calendar events from multiple heterogeneous external sources
//! (iCal feeds, CalDAV servers, ...) into a unified, deduplicated, queryable
//! view, served from a two-tier cache (in-memory hot tier backed by a
//! persistent on-disk tier) to amortize the cost of remote fetches.

pub mod calendar;

pub use calendar::{CalendarError, CalendarResult};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize global tracing. Safe to call more than once.
pub fn init() {
    let _ = tracing_subscriber::fmt::try_init();
    tracing::info!("Calendar aggregator v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        init();
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

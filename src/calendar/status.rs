/*!
 * Status Surface
 *
 * A snapshot of server/source health for the external HTTP bridge to poll
 * or subscribe to. The bridge itself is out of scope; this module only owns
 * the snapshot shape and the listener registry it pushes through.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::calendar::types::{CalendarSource, SourceStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatusEntry {
    pub id: String,
    pub name: String,
    pub status: SourceStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub server_status: ServerStatus,
    pub sources: Vec<SourceStatusEntry>,
}

impl StatusSnapshot {
    pub fn build(
        server_status: ServerStatus,
        sources: &[CalendarSource],
        last_sync: &HashMap<String, DateTime<Utc>>,
        last_error: &HashMap<String, String>,
    ) -> Self {
        let entries = sources
            .iter()
            .map(|s| SourceStatusEntry {
                id: s.id.clone(),
                name: s.name.clone(),
                status: s.status,
                last_sync: last_sync.get(&s.id).copied(),
                error: last_error.get(&s.id).cloned(),
            })
            .collect();

        Self { timestamp: Utc::now(), server_status, sources: entries }
    }
}

pub type StatusListenerFn = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;
pub type ListenerId = usize;

/// Observer list for status snapshots, keyed by id so callers can unregister.
/// Mirrors the config listener registry's panic-containment: one faulty
/// listener never stops the rest from being notified.
#[derive(Clone, Default)]
pub struct StatusListenerRegistry {
    listeners: Arc<RwLock<HashMap<ListenerId, StatusListenerFn>>>,
    next_id: Arc<AtomicUsize>,
}

impl StatusListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: StatusListenerFn) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().remove(&id);
    }

    pub fn notify(&self, snapshot: &StatusSnapshot) {
        for listener in self.listeners.read().values() {
            let listener = listener.clone();
            let snapshot = snapshot.clone();
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&snapshot))) {
                tracing::warn!("status listener panicked: {:?}", panic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::types::SourceType;

    #[test]
    fn snapshot_carries_last_sync_and_error_per_source() {
        let sources = vec![CalendarSource::new("s1", "Work", SourceType::Ical, "https://example.com/cal.ics")];
        let mut last_sync = HashMap::new();
        last_sync.insert("s1".to_string(), Utc::now());
        let mut last_error = HashMap::new();
        last_error.insert("s1".to_string(), "boom".to_string());

        let snapshot = StatusSnapshot::build(ServerStatus::Running, &sources, &last_sync, &last_error);
        assert_eq!(snapshot.sources.len(), 1);
        assert!(snapshot.sources[0].last_sync.is_some());
        assert_eq!(snapshot.sources[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn removed_listener_is_not_notified() {
        use std::sync::atomic::AtomicUsize;
        let registry = StatusListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = registry.add_listener(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        registry.remove_listener(id);

        let snapshot = StatusSnapshot::build(ServerStatus::Running, &[], &HashMap::new(), &HashMap::new());
        registry.notify(&snapshot);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = StatusListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add_listener(Arc::new(|_| panic!("boom")));
        let c = count.clone();
        registry.add_listener(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let snapshot = StatusSnapshot::build(ServerStatus::Running, &[], &HashMap::new(), &HashMap::new());
        registry.notify(&snapshot);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

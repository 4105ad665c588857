/*!
 * Adapter Registry
 *
 * Holds one adapter per `SourceType`. The engine looks an adapter up by the
 * type tag on a `CalendarSource` and never matches on concrete adapter
 * types directly.
 */

pub mod caldav;
pub mod ical;
pub mod traits;

pub use traits::Adapter;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::types::SourceType;

/// Registry of adapters keyed by the source type they handle.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<SourceType, Arc<dyn Adapter>>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { adapters: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Register an adapter for its declared type, replacing any previous
    /// registration for that type.
    pub async fn register(&self, adapter: Arc<dyn Adapter>) {
        let source_type = adapter.supported_type();
        self.adapters.write().await.insert(source_type, adapter);
    }

    /// Look up the adapter for a source type, or `UnsupportedSourceType` if
    /// none is registered.
    pub async fn get(&self, source_type: SourceType) -> CalendarResult<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .await
            .get(&source_type)
            .cloned()
            .ok_or_else(|| CalendarError::UnsupportedSourceType { source_type: source_type.to_string() })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a registry with the two reference adapters shipped by this crate.
pub async fn default_registry(http_client: reqwest::Client) -> AdapterRegistry {
    let registry = AdapterRegistry::new();
    registry.register(Arc::new(ical::IcalAdapter::new(http_client.clone()))).await;
    registry.register(Arc::new(caldav::CalDavAdapter::new(http_client))).await;
    registry
}

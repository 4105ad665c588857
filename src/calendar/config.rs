/*!
 * Calendar Configuration
 *
 * `CalendarConfig` and its `server`/`sources`/`cache` sub-structs, loaded via
 * the `config` crate from layered TOML + environment sources. File watching
 * and hot-reload live outside this crate; `ConfigListener` is the hook point
 * an external loader drives to push a reload in.
 */

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::types::CalendarSource;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// HTTP/server-adjacent knobs. The bridge that actually serves this surface
/// is an external collaborator; this struct only carries the settings it
/// would need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub auto_start: bool,
    pub cache_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080, auto_start: false, cache_timeout_seconds: 300 }
    }
}

/// Two-tier cache sizing and TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub memory_ttl_seconds: u64,
    pub persistent_ttl_seconds: u64,
    pub max_memory_events: usize,
    pub cleanup_interval_seconds: u64,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl_seconds: 60,
            persistent_ttl_seconds: 3600,
            max_memory_events: 10_000,
            cleanup_interval_seconds: 120,
            max_concurrent_fetches: 8,
            fetch_timeout_seconds: 15,
            max_retries: 3,
        }
    }
}

/// Top-level aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalendarConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<CalendarSource>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_database_url() -> String {
    "sqlite://calendar.db".to_string()
}

impl CalendarConfig {
    /// Load configuration by layering `base.toml`, an optional
    /// environment-named override file, and `CALENDAR_`-prefixed environment
    /// variables, in that order (later sources win), via the `config` crate.
    pub fn from_file(path: &str) -> CalendarResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("CALENDAR").separator("__"))
            .build()
            .map_err(|e| CalendarError::ConfigurationError { message: e.to_string(), field: None })?;

        let cfg: CalendarConfig = settings
            .try_deserialize()
            .map_err(|e| CalendarError::ConfigurationError { message: e.to_string(), field: None })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> CalendarResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("CALENDAR").separator("__"))
            .build()
            .map_err(|e| CalendarError::ConfigurationError { message: e.to_string(), field: None })?;

        let cfg: CalendarConfig = settings
            .try_deserialize()
            .map_err(|e| CalendarError::ConfigurationError { message: e.to_string(), field: None })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> CalendarResult<()> {
        if self.cache.max_concurrent_fetches == 0 {
            return Err(CalendarError::ConfigurationError {
                message: "max_concurrent_fetches must be greater than 0".to_string(),
                field: Some("cache.max_concurrent_fetches".to_string()),
            });
        }
        if self.cache.max_memory_events == 0 {
            return Err(CalendarError::ConfigurationError {
                message: "max_memory_events must be greater than 0".to_string(),
                field: Some("cache.max_memory_events".to_string()),
            });
        }
        if self.cache.fetch_timeout_seconds == 0 {
            return Err(CalendarError::ConfigurationError {
                message: "fetch_timeout_seconds must be greater than 0".to_string(),
                field: Some("cache.fetch_timeout_seconds".to_string()),
            });
        }
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(CalendarError::ConfigurationError {
                    message: "source id must not be empty".to_string(),
                    field: Some("sources[].id".to_string()),
                });
            }
        }
        Ok(())
    }
}

/// A callback driven by an external config loader when it observes a change.
/// Each listener is invoked independently so one faulty observer never
/// blocks the others, mirroring the engine's webhook dispatch.
pub type ConfigListenerFn = Arc<dyn Fn(&CalendarConfig) + Send + Sync>;

/// Registry of config-change observers.
#[derive(Clone, Default)]
pub struct ConfigListenerRegistry {
    listeners: Arc<RwLock<Vec<ConfigListenerFn>>>,
}

impl ConfigListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: ConfigListenerFn) {
        self.listeners.write().push(listener);
    }

    /// Notify every registered listener of a new configuration. A listener
    /// that panics is caught so it cannot prevent the rest from running.
    pub fn notify(&self, config: &CalendarConfig) {
        for listener in self.listeners.read().iter() {
            let listener = listener.clone();
            let config = config.clone();
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&config))) {
                tracing::warn!("config listener panicked: {:?}", panic);
            }
        }
    }
}

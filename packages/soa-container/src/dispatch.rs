//! Dispatch policy: decides, per call, whether a request runs inline on the
//! connection task or on the worker pool.
//!
//! The decision is re-evaluated on every request against the current
//! dynamic configuration snapshot. Reads go through `ArcSwap`, so a
//! configuration update never blocks the request path.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use soa_core::SoaHeader;

// ---------------------------------------------------------------------------
// Dynamic configuration
// ---------------------------------------------------------------------------

/// Keys understood in a per-method configuration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    /// `bool`: run the method on the worker pool.
    ThreadPool,
}

/// A configuration value as published by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Configuration entry for one `service.version.method.producer` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceConfig {
    values: HashMap<ConfigKey, ConfigValue>,
}

impl ServiceConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: ConfigKey, value: ConfigValue) -> Self {
        self.values.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: ConfigKey) -> Option<&ConfigValue> {
        self.values.get(&key)
    }

    /// Boolean value for `key`; `None` when absent or not a boolean.
    #[must_use]
    pub fn get_bool(&self, key: ConfigKey) -> Option<bool> {
        match self.get(key) {
            Some(ConfigValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

/// Read-only view of the registry's dynamic configuration.
///
/// Lookups must be cheap and side-effect free: the pipeline calls this once
/// per request. A missing key is `None`, not an error.
pub trait DynamicConfig: Send + Sync {
    fn get_config(&self, service_key: &str) -> Option<Arc<ServiceConfig>>;
}

/// Errors raised while loading a configuration snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid dynamic configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// In-memory [`DynamicConfig`] whose snapshot can be swapped atomically.
///
/// Registry watchers push updates with [`replace`](Self::replace) or
/// [`set`](Self::set); request threads keep reading the previous snapshot
/// until the swap lands.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    snapshot: ArcSwap<HashMap<String, Arc<ServiceConfig>>>,
}

impl StaticConfigSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a snapshot of the form
    /// `{"svc.v1.m1.producer": {"ThreadPool": false}}`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Json` when the document does not have that shape.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, ServiceConfig> = serde_json::from_str(json)?;
        let source = Self::new();
        source.replace(parsed);
        Ok(source)
    }

    /// Replaces the whole snapshot.
    pub fn replace(&self, entries: HashMap<String, ServiceConfig>) {
        let next = entries
            .into_iter()
            .map(|(key, config)| (key, Arc::new(config)))
            .collect::<HashMap<_, _>>();
        self.snapshot.store(Arc::new(next));
    }

    /// Inserts or overwrites a single entry.
    pub fn set(&self, service_key: impl Into<String>, config: ServiceConfig) {
        let key = service_key.into();
        let config = Arc::new(config);
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), Arc::clone(&config));
            next
        });
    }

    /// Removes a single entry, restoring the default for that key.
    pub fn remove(&self, service_key: &str) {
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(service_key);
            next
        });
    }
}

impl DynamicConfig for StaticConfigSource {
    fn get_config(&self, service_key: &str) -> Option<Arc<ServiceConfig>> {
        self.snapshot.load().get(service_key).cloned()
    }
}

// ---------------------------------------------------------------------------
// DispatchPolicy
// ---------------------------------------------------------------------------

/// Where a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// On the connection task that decoded the header.
    Inline,
    /// On the shared worker pool.
    Pooled,
}

/// Resolves [`Dispatch`] for each decoded header.
#[derive(Clone)]
pub struct DispatchPolicy {
    use_thread_pool: bool,
    config: Arc<dyn DynamicConfig>,
}

impl DispatchPolicy {
    /// `use_thread_pool` is the container-wide switch; when `false` every
    /// request runs inline regardless of the dynamic configuration.
    pub fn new(use_thread_pool: bool, config: Arc<dyn DynamicConfig>) -> Self {
        Self {
            use_thread_pool,
            config,
        }
    }

    /// Inline when pooling is disabled globally or the method's
    /// `ThreadPool` flag is `false`; pooled otherwise, including when the
    /// method has no configuration at all.
    #[must_use]
    pub fn decide(&self, header: &SoaHeader) -> Dispatch {
        if !self.use_thread_pool {
            return Dispatch::Inline;
        }

        let use_pool = self
            .config
            .get_config(&header.service_key())
            .and_then(|config| config.get_bool(ConfigKey::ThreadPool))
            .unwrap_or(true);

        if use_pool {
            Dispatch::Pooled
        } else {
            Dispatch::Inline
        }
    }
}

impl std::fmt::Debug for DispatchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPolicy")
            .field("use_thread_pool", &self.use_thread_pool)
            .finish_non_exhaustive()
    }
}

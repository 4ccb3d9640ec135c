use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use soa_core::{Processor, ProcessorKey};
use tracing::warn;

// ---------------------------------------------------------------------------
// ProcessorRegistry
// ---------------------------------------------------------------------------

/// Immutable `(service, version) -> processor` table, built once at startup.
///
/// Keyed as service then version so a lookup borrows the header's strings
/// instead of allocating a composite key per request.
#[derive(Default)]
pub struct ProcessorRegistry {
    by_service: HashMap<String, HashMap<String, Arc<dyn Processor>>>,
    len: usize,
}

impl ProcessorRegistry {
    /// Builds the table from processors, keyed by their own interface name
    /// and version. When two processors claim the same key the later one
    /// wins and a warning is logged.
    pub fn from_processors(processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        let mut registry = Self::default();
        for processor in processors {
            let service = processor.interface_name().to_string();
            let version = processor.version().to_string();
            let versions = registry.by_service.entry(service.clone()).or_default();
            if versions.insert(version.clone(), processor).is_some() {
                warn!(service = %service, version = %version, "duplicate processor binding replaced");
            } else {
                registry.len += 1;
            }
        }
        registry
    }

    /// Exact match on service name and version.
    #[must_use]
    pub fn lookup(&self, service_name: &str, version_name: &str) -> Option<Arc<dyn Processor>> {
        self.by_service
            .get(service_name)
            .and_then(|versions| versions.get(version_name))
            .cloned()
    }

    /// Every registered key, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<ProcessorKey> {
        let mut keys: Vec<_> = self
            .by_service
            .iter()
            .flat_map(|(service, versions)| {
                versions
                    .keys()
                    .map(move |version| ProcessorKey::new(service.clone(), version.clone()))
            })
            .collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RegistryAgent
// ---------------------------------------------------------------------------

/// External service registry the container announces itself to.
///
/// Failures are reported to the caller, which logs them; they never stop the
/// container from serving.
#[async_trait]
pub trait RegistryAgent: Send + Sync {
    /// Publishes one `(service, version)` served by this container.
    async fn register_service(&self, service_name: &str, version_name: &str) -> anyhow::Result<()>;

    /// Withdraws everything this container published.
    async fn unregister_all(&self) -> anyhow::Result<()>;
}

/// Agent for containers that are not announced anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistryAgent;

#[async_trait]
impl RegistryAgent for NoopRegistryAgent {
    async fn register_service(&self, _service_name: &str, _version_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unregister_all(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

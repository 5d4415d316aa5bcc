//! Named collection of providers sharing one broadcast hub.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nimbus_core::{BroadcastHub, ComponentStatus, ProviderKind, StatusReport};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::provider::Provider;

/// Per-instance bound for [`ProviderRegistry::aggregate_status`].
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, Arc<Provider>>>,
    hub: RwLock<Option<BroadcastHub>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hub(hub: BroadcastHub) -> Self {
        let registry = Self::new();
        registry.set_broadcast_hub(hub);
        registry
    }

    /// Registers `provider` under `name`, replacing any previous entry, and
    /// hands it the current hub.
    pub fn register(&self, name: impl Into<String>, provider: Arc<Provider>) {
        let name = name.into();
        provider.set_broadcast_hub(self.hub.read().clone());
        debug!(name = %name, kind = %provider.kind(), "registering provider");
        self.providers.write().insert(name, provider);
    }

    /// Rewires every registered provider to `hub`.
    pub fn set_broadcast_hub(&self, hub: BroadcastHub) {
        *self.hub.write() = Some(hub.clone());
        for provider in self.providers.read().values() {
            provider.set_broadcast_hub(Some(hub.clone()));
        }
    }

    pub fn broadcast_hub(&self) -> Option<BroadcastHub> {
        self.hub.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.read().get(name).cloned()
    }

    /// The provider registered under the kind's wire name.
    pub fn get_kind(&self, kind: ProviderKind) -> Option<Arc<Provider>> {
        self.get(kind.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Status of every provider, checked concurrently.
    pub async fn aggregate_status(&self) -> StatusReport {
        let entries: Vec<(String, Arc<Provider>)> = self
            .providers
            .read()
            .iter()
            .map(|(name, p)| (name.clone(), Arc::clone(p)))
            .collect();
        collect_statuses(entries, STATUS_TIMEOUT, |provider| async move {
            provider.status().await
        })
        .await
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish_non_exhaustive()
    }
}

/// Runs `check` for every entry on its own task, bounded by `bound`.
///
/// A check that panics or overruns is reported as an error for that entry
/// only.
pub async fn collect_statuses<T, F, Fut>(
    entries: Vec<(String, Arc<T>)>,
    bound: Duration,
    check: F,
) -> StatusReport
where
    T: Send + Sync + ?Sized + 'static,
    F: Fn(Arc<T>) -> Fut,
    Fut: Future<Output = ComponentStatus> + Send + 'static,
{
    let checks = entries.into_iter().map(|(name, entry)| {
        let handle = tokio::spawn(tokio::time::timeout(bound, check(entry)));
        async move {
            let status = match handle.await {
                Ok(Ok(status)) => status,
                Ok(Err(_)) => {
                    warn!(name = %name, bound_secs = bound.as_secs(), "status check timed out");
                    ComponentStatus::error(format!(
                        "status check timed out after {}s",
                        bound.as_secs()
                    ))
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "status check panicked");
                    ComponentStatus::error(format!("status check failed: {e}"))
                }
            };
            (name, status)
        }
    });
    join_all(checks).await.into_iter().collect()
}

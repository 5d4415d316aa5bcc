//! Named collection of controllers and the request entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use nimbus_core::{BroadcastHub, LogicalEnv, NimbusError, StatusReport};
use nimbus_integrations::{ProviderRegistry, STATUS_TIMEOUT, collect_statuses};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::controller::Controller;

pub struct ControllerRegistry {
    controllers: RwLock<BTreeMap<String, Arc<dyn Controller>>>,
    hub: RwLock<Option<BroadcastHub>>,
    providers: Arc<ProviderRegistry>,
}

impl ControllerRegistry {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            hub: RwLock::new(providers.broadcast_hub()),
            controllers: RwLock::new(BTreeMap::new()),
            providers,
        }
    }

    /// Registers `controller` under `name` and attaches it to the current hub
    /// and the provider registry.
    pub fn register(&self, name: impl Into<String>, controller: Arc<dyn Controller>) {
        let name = name.into();
        controller.attach(self.hub.read().clone(), Arc::clone(&self.providers));
        debug!(name = %name, actions = ?controller.actions(), "registering controller");
        self.controllers.write().insert(name, controller);
    }

    /// Rewires every controller, and the providers behind them, to `hub`.
    pub fn set_broadcast_hub(&self, hub: BroadcastHub) {
        *self.hub.write() = Some(hub.clone());
        self.providers.set_broadcast_hub(hub.clone());
        for controller in self.controllers.read().values() {
            controller.attach(Some(hub.clone()), Arc::clone(&self.providers));
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Controller>> {
        self.controllers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.controllers.read().keys().cloned().collect()
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Entry point for external requests.
    ///
    /// `params.logical_env` is mandatory; its absence is `MissingEnvironment`.
    pub async fn dispatch(
        &self,
        name: &str,
        action: &str,
        params: &Value,
    ) -> Result<Value, NimbusError> {
        let env = LogicalEnv::required(params.get("logical_env").and_then(Value::as_str))?;
        let controller = self
            .get(name)
            .ok_or_else(|| NimbusError::UnknownComponent(name.to_string()))?;

        let result = controller.invoke(action, &env, params).await;
        if let Err(e) = &result {
            warn!(controller = name, action, env = %env, error = %e, "action failed");
        }
        result
    }

    /// Resolves a login parked by the provider behind controller `name`.
    pub fn complete_login(&self, name: &str, success: bool) -> Result<bool, NimbusError> {
        let controller = self
            .get(name)
            .ok_or_else(|| NimbusError::UnknownComponent(name.to_string()))?;
        let provider = self
            .providers
            .get_kind(controller.provider_kind())
            .ok_or_else(|| NimbusError::UnknownComponent(name.to_string()))?;
        Ok(provider.complete_login(success))
    }

    /// Status of every controller, checked concurrently.
    pub async fn aggregate_status(&self) -> StatusReport {
        let entries: Vec<(String, Arc<dyn Controller>)> = self
            .controllers
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), Arc::clone(c)))
            .collect();
        collect_statuses(entries, STATUS_TIMEOUT, |controller| async move {
            controller.status().await
        })
        .await
    }
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("controllers", &self.names())
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

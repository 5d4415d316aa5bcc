//! Startup wiring: one hub, one provider per configured family, one
//! controller per provider.

use std::sync::Arc;

use nimbus_core::{BroadcastHub, NimbusConfig, NimbusError, ProviderKind};
use nimbus_integrations::{Provider, ProviderRegistry};
use nimbus_terminal::CommandRunner;
use tracing::info;

use crate::aws::AwsController;
use crate::controller::Controller;
use crate::gcp::GcpController;
use crate::kubernetes::KubernetesController;
use crate::registry::ControllerRegistry;

/// Everything a front-end needs, built once and passed around explicitly.
#[derive(Debug)]
pub struct Container {
    config: NimbusConfig,
    hub: BroadcastHub,
    providers: Arc<ProviderRegistry>,
    controllers: ControllerRegistry,
}

impl Container {
    /// Families without mappings get neither a provider nor a controller.
    pub fn build(
        config: NimbusConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, NimbusError> {
        config.validate()?;

        let hub = BroadcastHub::new(config.hub_queue_capacity);
        let providers = Arc::new(ProviderRegistry::with_hub(hub.clone()));
        for kind in ProviderKind::ALL {
            if config.mappings_for(kind).is_empty() {
                continue;
            }
            let provider = Provider::from_config(kind, &config, Arc::clone(&runner))?;
            providers.register(kind.as_str(), Arc::new(provider));
        }

        let controllers = ControllerRegistry::new(Arc::clone(&providers));
        for name in providers.names() {
            if let Some(controller) = controller_for(&name) {
                controllers.register(name, controller);
            }
        }

        info!(
            providers = ?providers.names(),
            controllers = ?controllers.names(),
            "container ready"
        );
        Ok(Self {
            config,
            hub,
            providers,
            controllers,
        })
    }

    pub fn config(&self) -> &NimbusConfig {
        &self.config
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn controllers(&self) -> &ControllerRegistry {
        &self.controllers
    }
}

fn controller_for(name: &str) -> Option<Arc<dyn Controller>> {
    match name.parse::<ProviderKind>().ok()? {
        ProviderKind::Aws => Some(Arc::new(AwsController::new())),
        ProviderKind::Gcp => Some(Arc::new(GcpController::new())),
        ProviderKind::Kubernetes => Some(Arc::new(KubernetesController::new())),
    }
}

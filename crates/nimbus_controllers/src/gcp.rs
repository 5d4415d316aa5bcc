use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{BroadcastHub, ComponentStatus, LogicalEnv, NimbusError, ProviderKind};
use nimbus_integrations::ProviderRegistry;
use nimbus_integrations::cloud::gcp::{self, ComputeInstance, GcpProjectInfo, GkeCluster};
use serde_json::Value;

use crate::controller::{Controller, ControllerBase, to_json};

const ACTIONS: &[&str] = &[
    "project_info",
    "list_compute_instances",
    "list_gke_clusters",
    "run",
    "complete_login",
];

/// GCP actions over the `gcp` provider.
pub struct GcpController {
    base: ControllerBase,
}

impl GcpController {
    pub fn new() -> Self {
        Self {
            base: ControllerBase::new("gcp", ProviderKind::Gcp),
        }
    }

    /// Describes the project mapped to `env`.
    pub async fn project_info(&self, env: &LogicalEnv) -> Result<GcpProjectInfo, NimbusError> {
        let project = self.base.provider()?.mapping(env)?.expected_identity.clone();
        let command = format!("gcloud projects describe {project} --format=json");
        self.base
            .query("project_info", env, &command, gcp::parse_project_info)
            .await
    }

    pub async fn list_compute_instances(
        &self,
        env: &LogicalEnv,
    ) -> Result<Vec<ComputeInstance>, NimbusError> {
        self.base
            .query(
                "list_compute_instances",
                env,
                "gcloud compute instances list --format=json",
                gcp::parse_compute_instances,
            )
            .await
    }

    pub async fn list_gke_clusters(&self, env: &LogicalEnv) -> Result<Vec<GkeCluster>, NimbusError> {
        self.base
            .query(
                "list_gke_clusters",
                env,
                "gcloud container clusters list --format=json",
                gcp::parse_gke_clusters,
            )
            .await
    }
}

impl Default for GcpController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for GcpController {
    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn provider_kind(&self) -> ProviderKind {
        self.base.kind()
    }

    fn actions(&self) -> &'static [&'static str] {
        ACTIONS
    }

    fn attach(&self, hub: Option<BroadcastHub>, providers: Arc<ProviderRegistry>) {
        self.base.attach(hub, providers);
    }

    async fn status(&self) -> ComponentStatus {
        self.base.status().await
    }

    async fn invoke(
        &self,
        action: &str,
        env: &LogicalEnv,
        params: &Value,
    ) -> Result<Value, NimbusError> {
        match action {
            "project_info" => to_json(self.project_info(env).await?),
            "list_compute_instances" => to_json(self.list_compute_instances(env).await?),
            "list_gke_clusters" => to_json(self.list_gke_clusters(env).await?),
            "run" => self.base.run_from_params(env, params).await,
            "complete_login" => self.base.complete_login_from_params(env, params),
            other => Err(self.base.unknown_action(other)),
        }
    }
}

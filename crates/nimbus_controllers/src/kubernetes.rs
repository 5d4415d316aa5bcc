use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{BroadcastHub, ComponentStatus, LogicalEnv, NimbusError, ProviderKind};
use nimbus_integrations::ProviderRegistry;
use nimbus_integrations::kubernetes::{self, Deployment, Pod};
use serde_json::Value;

use crate::controller::{Controller, ControllerBase, to_json};

/// Lines returned by `pod_logs` when no tail is given.
pub const DEFAULT_LOG_TAIL: u64 = 100;

const ACTIONS: &[&str] = &[
    "list_pods",
    "list_deployments",
    "pod_logs",
    "run",
    "complete_login",
];

/// Kubernetes actions over the `k8s` provider.
///
/// Without a namespace, commands use the namespace of the mapped context.
pub struct KubernetesController {
    base: ControllerBase,
}

impl KubernetesController {
    pub fn new() -> Self {
        Self {
            base: ControllerBase::new("k8s", ProviderKind::Kubernetes),
        }
    }

    pub async fn list_pods(
        &self,
        env: &LogicalEnv,
        namespace: Option<&str>,
    ) -> Result<Vec<Pod>, NimbusError> {
        let command = with_namespace("kubectl get pods -o json", namespace);
        self.base
            .query("list_pods", env, &command, kubernetes::parse_pod_list)
            .await
    }

    pub async fn list_deployments(
        &self,
        env: &LogicalEnv,
        namespace: Option<&str>,
    ) -> Result<Vec<Deployment>, NimbusError> {
        let command = with_namespace("kubectl get deployments -o json", namespace);
        self.base
            .query(
                "list_deployments",
                env,
                &command,
                kubernetes::parse_deployment_list,
            )
            .await
    }

    pub async fn pod_logs(
        &self,
        env: &LogicalEnv,
        name: &str,
        namespace: Option<&str>,
        tail: Option<u64>,
    ) -> Result<String, NimbusError> {
        let base = format!(
            "kubectl logs {name} --tail {}",
            tail.unwrap_or(DEFAULT_LOG_TAIL)
        );
        let command = with_namespace(&base, namespace);
        self.base
            .query("pod_logs", env, &command, |stdout| Ok(stdout.to_string()))
            .await
    }
}

impl Default for KubernetesController {
    fn default() -> Self {
        Self::new()
    }
}

fn with_namespace(command: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{command} -n {ns}"),
        None => command.to_string(),
    }
}

#[async_trait]
impl Controller for KubernetesController {
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
        if !ACTIONS.contains(&action) {
            return Err(self.base.unknown_action(action));
        }
        let namespace = self.base.token_param(env, params, "namespace")?;
        match action {
            "list_pods" => to_json(self.list_pods(env, namespace.as_deref()).await?),
            "list_deployments" => {
                to_json(self.list_deployments(env, namespace.as_deref()).await?)
            }
            "pod_logs" => {
                let name = self.base.required_token(env, params, "name")?;
                let tail = self.base.u64_param(env, params, "tail")?;
                to_json(
                    self.pod_logs(env, &name, namespace.as_deref(), tail)
                        .await?,
                )
            }
            "run" => self.base.run_from_params(env, params).await,
            "complete_login" => self.base.complete_login_from_params(env, params),
            other => Err(self.base.unknown_action(other)),
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{BroadcastHub, ComponentStatus, LogicalEnv, NimbusError, ProviderKind};
use nimbus_integrations::ProviderRegistry;
use nimbus_integrations::cloud::aws::{
    self, CallerIdentity, Ec2Instance, LambdaFunction, S3Bucket,
};
use serde_json::Value;

use crate::controller::{Controller, ControllerBase, to_json};

const ACTIONS: &[&str] = &[
    "whoami",
    "list_ec2_instances",
    "list_s3_buckets",
    "list_lambda_functions",
    "run",
    "complete_login",
];

/// AWS actions over the `aws` provider.
pub struct AwsController {
    base: ControllerBase,
}

impl AwsController {
    pub fn new() -> Self {
        Self {
            base: ControllerBase::new("aws", ProviderKind::Aws),
        }
    }

    pub async fn whoami(&self, env: &LogicalEnv) -> Result<CallerIdentity, NimbusError> {
        self.base
            .query(
                "whoami",
                env,
                "aws sts get-caller-identity --output json",
                aws::parse_caller_identity,
            )
            .await
    }

    pub async fn list_ec2_instances(
        &self,
        env: &LogicalEnv,
        region: Option<&str>,
    ) -> Result<Vec<Ec2Instance>, NimbusError> {
        let mut command =
            "aws ec2 describe-instances --query Reservations[].Instances[] --output json"
                .to_string();
        push_region(&mut command, region);
        self.base
            .query("list_ec2_instances", env, &command, aws::parse_ec2_instances)
            .await
    }

    pub async fn list_s3_buckets(&self, env: &LogicalEnv) -> Result<Vec<S3Bucket>, NimbusError> {
        self.base
            .query(
                "list_s3_buckets",
                env,
                "aws s3api list-buckets --output json",
                aws::parse_s3_buckets,
            )
            .await
    }

    pub async fn list_lambda_functions(
        &self,
        env: &LogicalEnv,
        region: Option<&str>,
    ) -> Result<Vec<LambdaFunction>, NimbusError> {
        let mut command = "aws lambda list-functions --output json".to_string();
        push_region(&mut command, region);
        self.base
            .query(
                "list_lambda_functions",
                env,
                &command,
                aws::parse_lambda_functions,
            )
            .await
    }
}

impl Default for AwsController {
    fn default() -> Self {
        Self::new()
    }
}

fn push_region(command: &mut String, region: Option<&str>) {
    if let Some(region) = region {
        command.push_str(" --region ");
        command.push_str(region);
    }
}

#[async_trait]
impl Controller for AwsController {
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
            "whoami" => to_json(self.whoami(env).await?),
            "list_ec2_instances" => {
                let region = self.base.token_param(env, params, "region")?;
                to_json(self.list_ec2_instances(env, region.as_deref()).await?)
            }
            "list_s3_buckets" => to_json(self.list_s3_buckets(env).await?),
            "list_lambda_functions" => {
                let region = self.base.token_param(env, params, "region")?;
                to_json(self.list_lambda_functions(env, region.as_deref()).await?)
            }
            "run" => self.base.run_from_params(env, params).await,
            "complete_login" => self.base.complete_login_from_params(env, params),
            other => Err(self.base.unknown_action(other)),
        }
    }
}

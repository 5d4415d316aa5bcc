//! Controller trait and the plumbing every family controller shares.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::context::is_valid_selector;
use nimbus_core::{
    BroadcastHub, BroadcastMessage, CommandExecution, CommandResult, ComponentStatus,
    LogicalEnv, NimbusError, ProviderKind,
};
use nimbus_integrations::{Provider, ProviderRegistry};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

/// Domain-level façade over one provider.
///
/// Every action names its logical environment; there is no implicit default.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Registry name, e.g. `"aws"`.
    fn name(&self) -> &'static str;

    fn provider_kind(&self) -> ProviderKind;

    /// Action names accepted by [`invoke`](Self::invoke).
    fn actions(&self) -> &'static [&'static str];

    /// Wires the controller to the hub and the providers it delegates to.
    fn attach(&self, hub: Option<BroadcastHub>, providers: Arc<ProviderRegistry>);

    async fn status(&self) -> ComponentStatus;

    /// Runs `action` with JSON `params` and returns a JSON result.
    async fn invoke(
        &self,
        action: &str,
        env: &LogicalEnv,
        params: &Value,
    ) -> Result<Value, NimbusError>;
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Hub and provider wiring shared by the concrete controllers.
pub struct ControllerBase {
    name: &'static str,
    kind: ProviderKind,
    hub: RwLock<Option<BroadcastHub>>,
    providers: RwLock<Option<Arc<ProviderRegistry>>>,
}

impl ControllerBase {
    pub fn new(name: &'static str, kind: ProviderKind) -> Self {
        Self {
            name,
            kind,
            hub: RwLock::new(None),
            providers: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn attach(&self, hub: Option<BroadcastHub>, providers: Arc<ProviderRegistry>) {
        *self.hub.write() = hub;
        *self.providers.write() = Some(providers);
    }

    pub fn provider(&self) -> Result<Arc<Provider>, NimbusError> {
        self.providers
            .read()
            .as_ref()
            .and_then(|registry| registry.get_kind(self.kind))
            .ok_or_else(|| NimbusError::UnknownComponent(self.kind.as_str().to_string()))
    }

    pub async fn status(&self) -> ComponentStatus {
        match self.provider() {
            Ok(provider) => provider.status().await,
            Err(e) => ComponentStatus::error(e.to_string()),
        }
    }

    /// Publishes an `action_log` message.
    pub fn log_action(&self, action: &str, env: &LogicalEnv, detail: Value) {
        debug!(controller = self.name, action, env = %env, "action finished");
        if let Some(hub) = self.hub.read().clone() {
            hub.publish(BroadcastMessage::action_log(self.name, action, env, detail));
        }
    }

    /// Runs `command` and fails on a timeout or nonzero exit.
    pub async fn run_checked(
        &self,
        env: &LogicalEnv,
        command: &str,
    ) -> Result<CommandExecution, NimbusError> {
        self.provider()?
            .execute(env, command, None)
            .await?
            .require_success()
    }

    /// Runs `command`, parses its stdout and logs the action either way.
    pub async fn query<T, P>(
        &self,
        action: &str,
        env: &LogicalEnv,
        command: &str,
        parse: P,
    ) -> Result<T, NimbusError>
    where
        P: FnOnce(&str) -> Result<T, String>,
    {
        let result = match self.run_checked(env, command).await {
            Ok(execution) => parse(&execution.stdout()).map_err(|cause| NimbusError::Parse {
                kind: self.kind,
                env: env.to_string(),
                cause,
            }),
            Err(e) => Err(e),
        };
        self.log_action(action, env, outcome_detail(command, result.as_ref().err()));
        result
    }

    /// Free-form `run`: a nonzero exit is part of the result, not an error.
    pub async fn run(
        &self,
        env: &LogicalEnv,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, NimbusError> {
        let result = match self.provider() {
            Ok(provider) => provider.execute(env, command, timeout).await,
            Err(e) => Err(e),
        };
        let detail = match &result {
            Ok(execution) => json!({
                "command": command,
                "success": execution.succeeded(),
                "exit_status": execution.exit_status,
                "timed_out": execution.timed_out,
            }),
            Err(e) => outcome_detail(command, Some(e)),
        };
        self.log_action("run", env, detail);
        result.map(|execution| execution.to_result())
    }

    /// Reports the outcome of an out-of-band login to a parked request.
    ///
    /// `success` defaults to `true`. The result says whether a login was
    /// waiting at all.
    pub fn complete_login_from_params(
        &self,
        env: &LogicalEnv,
        params: &Value,
    ) -> Result<Value, NimbusError> {
        let success = match params.get("success") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(self.invalid(env, format!("invalid 'success': {other}"))),
        };
        let resolved = self.provider()?.complete_login(success);
        self.log_action(
            "complete_login",
            env,
            json!({ "success": success, "resolved": resolved }),
        );
        Ok(json!({ "resolved": resolved }))
    }

    pub fn unknown_action(&self, action: &str) -> NimbusError {
        NimbusError::UnknownAction {
            component: self.name.to_string(),
            action: action.to_string(),
        }
    }

    pub fn invalid(&self, env: &LogicalEnv, reason: impl Into<String>) -> NimbusError {
        NimbusError::InvalidCommand {
            kind: self.kind,
            env: env.to_string(),
            reason: reason.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    /// Optional single-token parameter such as a region or namespace.
    pub fn token_param(
        &self,
        env: &LogicalEnv,
        params: &Value,
        key: &str,
    ) -> Result<Option<String>, NimbusError> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if is_valid_selector(s) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(env, format!("invalid '{key}': {other}"))),
        }
    }

    pub fn required_token(
        &self,
        env: &LogicalEnv,
        params: &Value,
        key: &str,
    ) -> Result<String, NimbusError> {
        self.token_param(env, params, key)?
            .ok_or_else(|| self.invalid(env, format!("missing '{key}'")))
    }

    pub fn u64_param(
        &self,
        env: &LogicalEnv,
        params: &Value,
        key: &str,
    ) -> Result<Option<u64>, NimbusError> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(env, format!("'{key}' must be a positive integer"))),
        }
    }

    /// `command` plus optional `timeout_secs`, as taken by every `run` action.
    pub async fn run_from_params(
        &self,
        env: &LogicalEnv,
        params: &Value,
    ) -> Result<Value, NimbusError> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(env, "missing 'command'"))?;
        let timeout = self
            .u64_param(env, params, "timeout_secs")?
            .map(Duration::from_secs);
        to_json(self.run(env, command, timeout).await?)
    }
}

fn outcome_detail(command: &str, error: Option<&NimbusError>) -> Value {
    match error {
        None => json!({ "command": command, "success": true }),
        Some(e) => json!({
            "command": command,
            "success": false,
            "error": e.to_string(),
            "category": e.category(),
        }),
    }
}

pub fn to_json<T: Serialize>(value: T) -> Result<Value, NimbusError> {
    serde_json::to_value(value).map_err(|e| NimbusError::Internal(format!("serialize result: {e}")))
}

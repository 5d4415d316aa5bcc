//! Per-family provider: owns the context state machine and runs commands
//! only under a verified context.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nimbus_core::{
    BroadcastHub, BroadcastMessage, CommandExecution, ComponentStatus, ContextMapping,
    ContextState, ContextStatus, ExecutionRecorder, Identity, LoginMode, LogicalEnv,
    NimbusConfig, NimbusError, ProviderKind,
};
use nimbus_terminal::{CommandRunner, CommandSpec};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::driver::{Driver, requires_login};
use crate::login::LoginGate;

/// Upper bound for the `--version` check behind [`Provider::status`].
const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Timing and login behaviour of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub freshness: Duration,
    pub command_timeout: Duration,
    pub lock_timeout: Duration,
    pub login_timeout: Duration,
    pub login_mode: LoginMode,
}

impl ProviderSettings {
    pub fn from_config(config: &NimbusConfig) -> Self {
        Self {
            freshness: config.freshness(),
            command_timeout: config.command_timeout(),
            lock_timeout: config.lock_timeout(),
            login_timeout: config.login_timeout(),
            login_mode: config.login_mode,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::from_config(&NimbusConfig::default())
    }
}

/// What a "who am I" probe told us.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProbeOutcome {
    Identity(Identity),
    LoginRequired(String),
    /// The probe ran but produced nothing usable.
    Unavailable(String),
}

/// Guarantees that commands for one tool family run under the mapped context.
///
/// Context mutations and command execution are serialized by an async lock;
/// different providers never contend with each other.
pub struct Provider {
    driver: Driver,
    mappings: HashMap<LogicalEnv, ContextMapping>,
    settings: ProviderSettings,
    runner: Arc<dyn CommandRunner>,
    hub: RwLock<Option<BroadcastHub>>,
    state: Mutex<ContextState>,
    /// Copy of `state` readable without waiting for the lock.
    snapshot: RwLock<ContextState>,
    login_gate: LoginGate,
}

impl Provider {
    pub fn new(
        driver: Driver,
        mappings: Vec<ContextMapping>,
        settings: ProviderSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, NimbusError> {
        let kind = driver.kind();
        let mut by_env = HashMap::with_capacity(mappings.len());
        for mapping in mappings {
            mapping.validate()?;
            if mapping.provider_kind != kind {
                return Err(NimbusError::Config(format!(
                    "{} mapping for '{}' given to the {kind} provider",
                    mapping.provider_kind, mapping.logical_env
                )));
            }
            let env = mapping.logical_env.clone();
            if by_env.insert(env.clone(), mapping).is_some() {
                return Err(NimbusError::Config(format!(
                    "duplicate mapping for {kind}/{env}"
                )));
            }
        }

        Ok(Self {
            driver,
            mappings: by_env,
            settings,
            runner,
            hub: RwLock::new(None),
            state: Mutex::new(ContextState::new(kind)),
            snapshot: RwLock::new(ContextState::new(kind)),
            login_gate: LoginGate::new(),
        })
    }

    /// Builds the provider for `kind` from the loaded configuration.
    pub fn from_config(
        kind: ProviderKind,
        config: &NimbusConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, NimbusError> {
        Self::new(
            Driver::for_kind(kind, config.program_for(kind)),
            config.mappings_for(kind),
            ProviderSettings::from_config(config),
            runner,
        )
    }

    pub fn kind(&self) -> ProviderKind {
        self.driver.kind()
    }

    /// Registry name, identical to the wire name of the kind.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Configured environments, sorted.
    pub fn environments(&self) -> Vec<LogicalEnv> {
        let mut envs: Vec<LogicalEnv> = self.mappings.keys().cloned().collect();
        envs.sort();
        envs
    }

    pub fn mapping(&self, env: &LogicalEnv) -> Result<&ContextMapping, NimbusError> {
        self.mappings
            .get(env)
            .ok_or_else(|| NimbusError::MissingMapping {
                kind: self.kind(),
                env: env.to_string(),
            })
    }

    pub fn set_broadcast_hub(&self, hub: Option<BroadcastHub>) {
        *self.hub.write() = hub;
    }

    fn hub(&self) -> Option<BroadcastHub> {
        self.hub.read().clone()
    }

    fn broadcast(&self, message: BroadcastMessage) {
        if let Some(hub) = self.hub() {
            hub.publish(message);
        }
    }

    /// Last known context. Never waits for an in-flight switch.
    pub fn context_state(&self) -> ContextState {
        self.snapshot.read().clone()
    }

    /// Resolves a login parked in `AuthRequired`. `false` when none was parked.
    pub fn complete_login(&self, success: bool) -> bool {
        let resolved = self.login_gate.complete(success);
        if resolved {
            info!(provider = %self.kind(), success, "login completion reported");
        }
        resolved
    }

    /// `true` while a login is parked waiting for [`complete_login`](Self::complete_login).
    pub fn is_awaiting_login(&self) -> bool {
        self.login_gate.is_waiting()
    }

    /// Forces the next request to verify again.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.invalidate();
        *self.snapshot.write() = state.clone();
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    async fn lock_state(
        &self,
        env: &LogicalEnv,
    ) -> Result<MutexGuard<'_, ContextState>, NimbusError> {
        tokio::time::timeout(self.settings.lock_timeout, self.state.lock())
            .await
            .map_err(|_| {
                warn!(provider = %self.kind(), env = %env, "context lock wait timed out");
                NimbusError::LockTimeout {
                    kind: self.kind(),
                    env: env.to_string(),
                    waited_secs: self.settings.lock_timeout.as_secs(),
                }
            })
    }

    /// Makes `env` the verified active context, switching and logging in as
    /// needed.
    ///
    /// Returns immediately when the context was verified for `env` within the
    /// freshness window.
    pub async fn ensure_context(&self, env: &LogicalEnv) -> Result<ContextState, NimbusError> {
        let mapping = self.mapping(env)?;
        let mut state = self.lock_state(env).await?;
        self.ensure_locked(&mut state, mapping).await
    }

    async fn ensure_locked(
        &self,
        state: &mut ContextState,
        mapping: &ContextMapping,
    ) -> Result<ContextState, NimbusError> {
        if state.is_fresh_for(mapping, self.settings.freshness, Utc::now()) {
            debug!(provider = %self.kind(), env = %mapping.logical_env, "context still fresh");
            return Ok(state.clone());
        }

        let result = self.verify_and_switch(state, mapping).await;
        if let Err(e) = &result {
            if state.status != ContextStatus::Failed {
                state.mark_failed(e.to_string());
            }
        }
        *self.snapshot.write() = state.clone();
        result.map(|()| state.clone())
    }

    async fn verify_and_switch(
        &self,
        state: &mut ContextState,
        mapping: &ContextMapping,
    ) -> Result<(), NimbusError> {
        let env = &mapping.logical_env;
        state.begin(env)?;

        let mut switched = false;
        let mut logged_in = false;
        loop {
            let pinned = state.active_selector.clone();
            match self.probe(env, pinned.as_deref()).await? {
                ProbeOutcome::Identity(identity) if mapping.is_satisfied_by(&identity) => {
                    info!(
                        provider = %self.kind(),
                        env = %env,
                        identity = %identity,
                        "context verified"
                    );
                    state.mark_verified(identity, Utc::now())?;
                    return Ok(());
                }
                ProbeOutcome::LoginRequired(detail) => {
                    self.login(state, mapping, detail, &mut logged_in).await?;
                    continue;
                }
                ProbeOutcome::Identity(identity) if switched => {
                    let actual = identity.to_string();
                    state.mark_mismatched(Some(identity))?;
                    return Err(self.switch_failed(
                        mapping,
                        Some(&actual),
                        NimbusError::ContextMismatch {
                            kind: self.kind(),
                            env: env.to_string(),
                            expected: expected_label(mapping),
                            actual: actual.clone(),
                        },
                    ));
                }
                ProbeOutcome::Unavailable(detail) if switched => {
                    return Err(self.switch_failed(
                        mapping,
                        None,
                        NimbusError::SwitchFailed {
                            kind: self.kind(),
                            env: env.to_string(),
                            cause: format!("identity probe failed after switch: {detail}"),
                        },
                    ));
                }
                ProbeOutcome::Identity(identity) => {
                    warn!(
                        provider = %self.kind(),
                        env = %env,
                        expected = %expected_label(mapping),
                        actual = %identity,
                        "context mismatch"
                    );
                    state.mark_mismatched(Some(identity))?;
                }
                ProbeOutcome::Unavailable(detail) => {
                    warn!(provider = %self.kind(), env = %env, detail = %detail, "identity unknown");
                    state.mark_mismatched(None)?;
                }
            }

            self.switch(state, mapping, &mut logged_in).await?;
            switched = true;
        }
    }

    async fn probe(
        &self,
        env: &LogicalEnv,
        selector: Option<&str>,
    ) -> Result<ProbeOutcome, NimbusError> {
        let execution = self
            .run_quiet(env, self.driver.probe_command(selector), self.settings.command_timeout)
            .await?;
        let output = combined_output(&execution);

        if requires_login(&output) {
            return Ok(ProbeOutcome::LoginRequired(first_line(&output)));
        }
        if execution.timed_out {
            return Ok(ProbeOutcome::Unavailable("identity probe timed out".into()));
        }
        if !execution.succeeded() {
            return Ok(ProbeOutcome::Unavailable(format!(
                "identity probe exited with {}: {}",
                exit_label(&execution),
                first_line(&output)
            )));
        }
        Ok(match self.driver.parse_identity(&execution.stdout(), selector) {
            Ok(identity) => ProbeOutcome::Identity(identity),
            Err(cause) => ProbeOutcome::Unavailable(cause),
        })
    }

    async fn switch(
        &self,
        state: &mut ContextState,
        mapping: &ContextMapping,
        logged_in: &mut bool,
    ) -> Result<(), NimbusError> {
        let env = &mapping.logical_env;
        self.broadcast(BroadcastMessage::context_switch_started(
            self.kind(),
            env,
            state.active_selector.as_deref(),
            &mapping.selector,
        ));
        info!(
            provider = %self.kind(),
            env = %env,
            from = ?state.active_selector,
            to = %mapping.selector,
            "switching context"
        );

        loop {
            let execution = self
                .run_quiet(env, self.driver.switch_command(mapping), self.settings.command_timeout)
                .await?;
            let output = combined_output(&execution);

            if requires_login(&output) {
                self.login(state, mapping, first_line(&output), logged_in)
                    .await?;
                continue;
            }
            if !execution.succeeded() {
                let cause = if execution.timed_out {
                    "switch command timed out".to_string()
                } else {
                    format!(
                        "switch command exited with {}: {}",
                        exit_label(&execution),
                        first_line(&output)
                    )
                };
                let actual = state.current_identity.as_ref().map(ToString::to_string);
                return Err(self.switch_failed(
                    mapping,
                    actual.as_deref(),
                    NimbusError::SwitchFailed {
                        kind: self.kind(),
                        env: env.to_string(),
                        cause,
                    },
                ));
            }

            state.mark_switched(&mapping.selector)?;
            return Ok(());
        }
    }

    /// Publishes `context_switch_failed` and hands back `error`.
    fn switch_failed(
        &self,
        mapping: &ContextMapping,
        actual: Option<&str>,
        error: NimbusError,
    ) -> NimbusError {
        warn!(provider = %self.kind(), env = %mapping.logical_env, error = %error, "context switch failed");
        self.broadcast(BroadcastMessage::context_switch_failed(
            self.kind(),
            &mapping.logical_env,
            &expected_label(mapping),
            actual,
            &error.to_string(),
        ));
        error
    }

    /// Moves to `AuthRequired`, announces it once and waits for the login.
    async fn login(
        &self,
        state: &mut ContextState,
        mapping: &ContextMapping,
        detail: String,
        logged_in: &mut bool,
    ) -> Result<(), NimbusError> {
        let hint = self.driver.login_hint(mapping);
        let auth_error = NimbusError::AuthRequired {
            kind: self.kind(),
            env: mapping.logical_env.to_string(),
            login_hint: hint.clone(),
        };
        if *logged_in {
            // Still asking for a login right after one completed.
            return Err(auth_error);
        }
        *logged_in = true;

        state.mark_auth_required(detail)?;
        *self.snapshot.write() = state.clone();
        warn!(provider = %self.kind(), env = %mapping.logical_env, hint = %hint, "authentication required");
        self.broadcast(BroadcastMessage::auth_required(
            self.kind(),
            &mapping.logical_env,
            &hint,
        ));

        if self.await_login(mapping).await {
            state.mark_login_completed()?;
            info!(provider = %self.kind(), env = %mapping.logical_env, "login completed");
            Ok(())
        } else {
            Err(auth_error)
        }
    }

    async fn await_login(&self, mapping: &ContextMapping) -> bool {
        let command = match self.settings.login_mode {
            LoginMode::Interactive => self.driver.login_command(mapping),
            LoginMode::External => None,
        };
        let Some(command) = command else {
            return self.login_gate.wait(self.settings.login_timeout).await;
        };

        // Streamed, so a watcher can show device codes or browser URLs.
        let mut recorder =
            ExecutionRecorder::start(self.kind(), mapping.logical_env.clone(), command.clone());
        let spec = CommandSpec::new(
            self.kind(),
            mapping.logical_env.clone(),
            recorder.id(),
            self.driver.argv(&command),
        )
        .with_timeout(self.settings.login_timeout)
        .with_env_remove(self.driver.scrubbed_env().iter().copied());

        let hub = self.hub();
        match self.runner.run(spec, hub.as_ref()).await {
            Ok(stream) => {
                let outcome = stream.record_into(&mut recorder).await;
                if !outcome.success() {
                    warn!(
                        provider = %self.kind(),
                        exit_status = ?outcome.exit_status,
                        timed_out = outcome.timed_out,
                        "login command did not succeed"
                    );
                }
                outcome.success()
            }
            Err(e) => {
                warn!(provider = %self.kind(), error = %e, "login command could not start");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Runs `command_text` under the verified context for `env`.
    ///
    /// The text is split on whitespace; see [`execute_args`](Self::execute_args)
    /// for arguments that contain spaces.
    pub async fn execute(
        &self,
        env: &LogicalEnv,
        command_text: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandExecution, NimbusError> {
        let mapping = self.mapping(env)?;
        let prepared = self
            .driver
            .prepare_line(mapping, command_text)
            .map_err(|reason| self.invalid_command(env, reason))?;
        self.execute_prepared(env, mapping, prepared, timeout).await
    }

    /// Runs an already split command under the verified context for `env`.
    ///
    /// The command is validated and pinned to the mapping before anything
    /// launches. If the context cannot be ensured the tool is never invoked.
    /// A nonzero exit status is returned as data.
    pub async fn execute_args(
        &self,
        env: &LogicalEnv,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandExecution, NimbusError> {
        let mapping = self.mapping(env)?;
        let prepared = self
            .driver
            .prepare(mapping, args)
            .map_err(|reason| self.invalid_command(env, reason))?;
        self.execute_prepared(env, mapping, prepared, timeout).await
    }

    fn invalid_command(&self, env: &LogicalEnv, reason: String) -> NimbusError {
        NimbusError::InvalidCommand {
            kind: self.kind(),
            env: env.to_string(),
            reason,
        }
    }

    async fn execute_prepared(
        &self,
        env: &LogicalEnv,
        mapping: &ContextMapping,
        prepared: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<CommandExecution, NimbusError> {
        let mut state = self.lock_state(env).await?;
        self.ensure_locked(&mut state, mapping).await?;

        let command_text = prepared.join(" ");
        debug!(provider = %self.kind(), env = %env, command = %command_text, "executing");
        let mut recorder = ExecutionRecorder::start(self.kind(), env.clone(), command_text);
        let spec = CommandSpec::new(self.kind(), env.clone(), recorder.id(), prepared)
            .with_timeout(timeout.unwrap_or(self.settings.command_timeout))
            .with_env_remove(self.driver.scrubbed_env().iter().copied());

        let hub = self.hub();
        let stream = self.runner.run(spec, hub.as_ref()).await?;
        let outcome = stream.record_into(&mut recorder).await;
        let execution = recorder.finish(outcome.exit_status, outcome.timed_out);

        if execution.timed_out {
            warn!(provider = %self.kind(), env = %env, id = %execution.id, "command timed out");
        } else if !execution.succeeded() && requires_login(&combined_output(&execution)) {
            // Credentials expired mid-window; verify again next time.
            warn!(provider = %self.kind(), env = %env, "command reported an expired login");
            state.invalidate();
            *self.snapshot.write() = state.clone();
        }
        Ok(execution)
    }

    /// Runs a command whose output stays off the hub.
    async fn run_quiet(
        &self,
        env: &LogicalEnv,
        command: String,
        timeout: Duration,
    ) -> Result<CommandExecution, NimbusError> {
        debug!(provider = %self.kind(), env = %env, command = %command, "running quiet command");
        let mut recorder = ExecutionRecorder::start(self.kind(), env.clone(), command.clone());
        let args = self.driver.argv(&command);
        let spec = CommandSpec::new(self.kind(), env.clone(), recorder.id(), args)
            .quiet()
            .with_timeout(timeout)
            .with_env_remove(self.driver.scrubbed_env().iter().copied());
        let stream = self.runner.run(spec, None).await?;
        let outcome = stream.record_into(&mut recorder).await;
        Ok(recorder.finish(outcome.exit_status, outcome.timed_out))
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Checks the tool launches and reports the context summary.
    ///
    /// Takes no lock and changes no state.
    pub async fn status(&self) -> ComponentStatus {
        let summary = self.context_state().summary();
        let Some(env) = self.environments().into_iter().next() else {
            return ComponentStatus::error(format!("no context mappings configured; {summary}"));
        };

        match self
            .run_quiet(&env, self.driver.version_command(), STATUS_CHECK_TIMEOUT)
            .await
        {
            Ok(execution) if execution.succeeded() => {
                let version = first_line(&combined_output(&execution));
                ComponentStatus::healthy(format!("{version}; {summary}"))
            }
            Ok(execution) => ComponentStatus::error(format!(
                "'{}' exited with {}; {summary}",
                self.driver.version_command(),
                exit_label(&execution)
            )),
            Err(e) => ComponentStatus::error(e.to_string()),
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("kind", &self.kind())
            .field("environments", &self.environments())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn expected_label(mapping: &ContextMapping) -> String {
    format!("{} (via {})", mapping.expected_identity, mapping.selector)
}

fn combined_output(execution: &CommandExecution) -> String {
    let mut out = execution.stdout();
    if !execution.stderr_sequence.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&execution.stderr());
    }
    out
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn exit_label(execution: &CommandExecution) -> String {
    execution
        .exit_status
        .map_or_else(|| "no status".to_string(), |c| format!("status {c}"))
}

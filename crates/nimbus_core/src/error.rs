use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ProviderKind;

/// Top-level error type shared by every nimbus crate.
///
/// Variants that concern a specific tool always carry the provider kind and
/// the logical environment so user-facing messages are never generic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NimbusError {
    #[error("logical environment is required but was not supplied")]
    MissingEnvironment,

    #[error("invalid logical environment name '{0}'")]
    InvalidEnvironment(String),

    #[error("[{kind}/{env}] no context mapping configured")]
    MissingMapping { kind: ProviderKind, env: String },

    #[error("[{kind}/{env}] identity mismatch: expected '{expected}', got '{actual}'")]
    ContextMismatch {
        kind: ProviderKind,
        env: String,
        expected: String,
        actual: String,
    },

    #[error("[{kind}/{env}] context switch failed: {cause}")]
    SwitchFailed {
        kind: ProviderKind,
        env: String,
        cause: String,
    },

    #[error("[{kind}/{env}] timed out after {waited_secs}s waiting for the context lock")]
    LockTimeout {
        kind: ProviderKind,
        env: String,
        waited_secs: u64,
    },

    #[error("[{kind}/{env}] authentication required: {login_hint}")]
    AuthRequired {
        kind: ProviderKind,
        env: String,
        login_hint: String,
    },

    #[error("[{kind}/{env}] failed to launch '{program}': {cause}")]
    Launch {
        kind: ProviderKind,
        env: String,
        program: String,
        cause: String,
    },

    #[error("[{kind}/{env}] command timed out after {secs}s")]
    Timeout {
        kind: ProviderKind,
        env: String,
        secs: u64,
    },

    #[error("[{kind}/{env}] command exited with status {exit_status}: {detail}")]
    CommandFailed {
        kind: ProviderKind,
        env: String,
        exit_status: String,
        detail: String,
    },

    #[error("[{kind}/{env}] rejected command: {reason}")]
    InvalidCommand {
        kind: ProviderKind,
        env: String,
        reason: String,
    },

    #[error("[{kind}/{env}] could not parse tool output: {cause}")]
    Parse {
        kind: ProviderKind,
        env: String,
        cause: String,
    },

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("no component registered under '{0}'")]
    UnknownComponent(String),

    #[error("'{component}' has no action '{action}'")]
    UnknownAction { component: String, action: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of errors for logging and user display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The caller supplied something unusable (missing env, bad command).
    UserError,
    /// Context could not be established or verified. Never auto-retried.
    ContextError,
    /// A human has to complete a login flow.
    AuthError,
    /// The external tool could not be launched or ran out of time.
    ExecutionError,
    /// Invalid or missing configuration.
    ConfigError,
    /// Internal system error.
    SystemError,
}

impl NimbusError {
    /// Returns the broad error category for routing and display purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingEnvironment
            | Self::InvalidEnvironment(_)
            | Self::InvalidCommand { .. }
            | Self::UnknownComponent(_)
            | Self::UnknownAction { .. } => ErrorCategory::UserError,
            Self::MissingMapping { .. }
            | Self::ContextMismatch { .. }
            | Self::SwitchFailed { .. }
            | Self::LockTimeout { .. } => ErrorCategory::ContextError,
            Self::AuthRequired { .. } => ErrorCategory::AuthError,
            Self::Launch { .. }
            | Self::Timeout { .. }
            | Self::CommandFailed { .. }
            | Self::Parse { .. } => ErrorCategory::ExecutionError,
            Self::Config(_) => ErrorCategory::ConfigError,
            Self::Broadcast(_) | Self::Internal(_) => ErrorCategory::SystemError,
        }
    }

    /// `true` for the fail-fast context family.
    pub fn is_context_error(&self) -> bool {
        self.category() == ErrorCategory::ContextError
    }

    /// Provider kind the error is attributed to, if any.
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        match self {
            Self::MissingMapping { kind, .. }
            | Self::ContextMismatch { kind, .. }
            | Self::SwitchFailed { kind, .. }
            | Self::LockTimeout { kind, .. }
            | Self::AuthRequired { kind, .. }
            | Self::Launch { kind, .. }
            | Self::Timeout { kind, .. }
            | Self::CommandFailed { kind, .. }
            | Self::InvalidCommand { kind, .. }
            | Self::Parse { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns a message suitable for showing to an operator.
    pub fn user_message(&self) -> String {
        match self {
            Self::ContextMismatch {
                kind,
                env,
                expected,
                actual,
            } => format!(
                "Refusing to run against {kind} for '{env}': expected identity {expected} but the tool reports {actual}."
            ),
            Self::AuthRequired {
                kind,
                env,
                login_hint,
            } => format!("Login required for {kind} ({env}). Run: {login_hint}"),
            Self::Internal(_) => "An unexpected error occurred.".into(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NimbusError>;

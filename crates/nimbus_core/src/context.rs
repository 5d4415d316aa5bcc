use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::NimbusError;

static ENV_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("env name pattern"));

static SELECTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._@:/-]{1,256}$").expect("selector pattern"));

// ---------------------------------------------------------------------------
// Provider kind
// ---------------------------------------------------------------------------

/// Tool family a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "gcp")]
    Gcp,
    #[serde(rename = "k8s", alias = "kubernetes")]
    Kubernetes,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Aws, Self::Gcp, Self::Kubernetes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Kubernetes => "k8s",
        }
    }

    /// Executable name used when no explicit path is configured.
    pub fn default_program(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcloud",
            Self::Kubernetes => "kubectl",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" | "gcloud" => Ok(Self::Gcp),
            "k8s" | "kubernetes" | "kubectl" => Ok(Self::Kubernetes),
            other => Err(NimbusError::UnknownComponent(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Logical environment
// ---------------------------------------------------------------------------

/// A validated logical environment name such as `dev` or `prod`.
///
/// There is no default: every entry point has to name one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalEnv(String);

impl LogicalEnv {
    pub fn new(name: impl Into<String>) -> Result<Self, NimbusError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(NimbusError::MissingEnvironment);
        }
        if !ENV_NAME_RE.is_match(&name) {
            return Err(NimbusError::InvalidEnvironment(name));
        }
        Ok(Self(name))
    }

    /// Converts an optional boundary value, treating absence as an error.
    pub fn required(name: Option<&str>) -> Result<Self, NimbusError> {
        match name {
            Some(n) => Self::new(n),
            None => Err(NimbusError::MissingEnvironment),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LogicalEnv {
    type Error = NimbusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LogicalEnv> for String {
    fn from(env: LogicalEnv) -> Self {
        env.0
    }
}

impl FromStr for LogicalEnv {
    type Err = NimbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for LogicalEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `true` when the value can be spliced into command text unquoted.
pub fn is_valid_selector(value: &str) -> bool {
    SELECTOR_RE.is_match(value)
}

// ---------------------------------------------------------------------------
// Mapping & identity
// ---------------------------------------------------------------------------

/// Static binding of a logical environment to a tool-level context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMapping {
    pub provider_kind: ProviderKind,
    pub logical_env: LogicalEnv,
    /// AWS profile, gcloud configuration or kube context name.
    pub selector: String,
    /// Account id, project id or cluster name the live probe must report.
    pub expected_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl ContextMapping {
    pub fn new(
        provider_kind: ProviderKind,
        logical_env: LogicalEnv,
        selector: impl Into<String>,
        expected_identity: impl Into<String>,
    ) -> Self {
        Self {
            provider_kind,
            logical_env,
            selector: selector.into(),
            expected_identity: expected_identity.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn validate(&self) -> Result<(), NimbusError> {
        let bad = |what: &str, value: &str| {
            NimbusError::Config(format!(
                "[{}/{}] invalid {what} '{value}'",
                self.provider_kind, self.logical_env
            ))
        };
        if !is_valid_selector(&self.selector) {
            return Err(bad("selector", &self.selector));
        }
        if !is_valid_selector(&self.expected_identity) {
            return Err(bad("expected_identity", &self.expected_identity));
        }
        if let Some(region) = &self.region {
            if !is_valid_selector(region) {
                return Err(bad("region", region));
            }
        }
        Ok(())
    }

    /// Both the principal and the active selector have to line up.
    pub fn is_satisfied_by(&self, identity: &Identity) -> bool {
        identity.principal == self.expected_identity
            && identity.selector.as_deref() == Some(self.selector.as_str())
    }
}

/// What a live "who am I" probe reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl Identity {
    pub fn new(principal: impl Into<String>, selector: Option<String>) -> Self {
        Self {
            principal: principal.into(),
            selector,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Some(sel) => write!(f, "{} (via {sel})", self.principal),
            None => f.write_str(&self.principal),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Unverified,
    Verified,
    Mismatched,
    AuthRequired,
    Failed,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Mismatched => "mismatched",
            Self::AuthRequired => "auth_required",
            Self::Failed => "failed",
        }
    }

    /// Legal edges of the context state machine.
    ///
    /// Any state may fail. A probe that runs right after a switch happens in
    /// `Unverified`, so `Unverified -> AuthRequired` is allowed as well.
    pub fn can_transition_to(self, next: ContextStatus) -> bool {
        use ContextStatus::*;
        if next == Failed || self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unverified, Verified)
                | (Unverified, Mismatched)
                | (Unverified, AuthRequired)
                | (Mismatched, Unverified)
                | (Mismatched, AuthRequired)
                | (Verified, Unverified)
                | (Verified, AuthRequired)
                | (AuthRequired, Unverified)
                | (Failed, Unverified)
        )
    }
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current context of one provider. Only the owning provider mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextState {
    pub provider_kind: ProviderKind,
    pub logical_env: Option<LogicalEnv>,
    pub active_selector: Option<String>,
    pub current_identity: Option<Identity>,
    pub verified_at: Option<DateTime<Utc>>,
    pub status: ContextStatus,
    pub last_error: Option<String>,
}

impl ContextState {
    pub fn new(provider_kind: ProviderKind) -> Self {
        Self {
            provider_kind,
            logical_env: None,
            active_selector: None,
            current_identity: None,
            verified_at: None,
            status: ContextStatus::Unverified,
            last_error: None,
        }
    }

    /// `true` when a verification for `mapping` is still inside `window`.
    pub fn is_fresh_for(
        &self,
        mapping: &ContextMapping,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != ContextStatus::Verified
            || self.logical_env.as_ref() != Some(&mapping.logical_env)
            || self.active_selector.as_deref() != Some(mapping.selector.as_str())
        {
            return false;
        }
        let Some(identity) = &self.current_identity else {
            return false;
        };
        if !mapping.is_satisfied_by(identity) {
            return false;
        }
        match self.verified_at {
            Some(at) => match chrono::Duration::from_std(window) {
                Ok(window) => now.signed_duration_since(at) < window,
                Err(_) => true,
            },
            None => false,
        }
    }

    fn transition(&mut self, next: ContextStatus) -> Result<(), NimbusError> {
        if !self.status.can_transition_to(next) {
            return Err(NimbusError::Internal(format!(
                "[{}] illegal context transition {} -> {}",
                self.provider_kind, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Starts a fresh attempt for `env`. Previous verifications are dropped.
    pub fn begin(&mut self, env: &LogicalEnv) -> Result<(), NimbusError> {
        self.transition(ContextStatus::Unverified)?;
        self.logical_env = Some(env.clone());
        self.verified_at = None;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_verified(
        &mut self,
        identity: Identity,
        now: DateTime<Utc>,
    ) -> Result<(), NimbusError> {
        self.transition(ContextStatus::Verified)?;
        self.active_selector = identity.selector.clone();
        self.current_identity = Some(identity);
        self.verified_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    /// `identity` is `None` when the probe could not tell who we are.
    pub fn mark_mismatched(&mut self, identity: Option<Identity>) -> Result<(), NimbusError> {
        self.transition(ContextStatus::Mismatched)?;
        if let Some(identity) = &identity {
            self.active_selector = identity.selector.clone();
        }
        self.current_identity = identity;
        self.verified_at = None;
        Ok(())
    }

    /// A switch to `selector` succeeded; identity must be probed again.
    pub fn mark_switched(&mut self, selector: &str) -> Result<(), NimbusError> {
        self.transition(ContextStatus::Unverified)?;
        self.active_selector = Some(selector.to_string());
        self.current_identity = None;
        self.verified_at = None;
        Ok(())
    }

    pub fn mark_auth_required(&mut self, cause: impl Into<String>) -> Result<(), NimbusError> {
        self.transition(ContextStatus::AuthRequired)?;
        self.verified_at = None;
        self.last_error = Some(cause.into());
        Ok(())
    }

    pub fn mark_login_completed(&mut self) -> Result<(), NimbusError> {
        if self.status != ContextStatus::AuthRequired {
            return Err(NimbusError::Internal(format!(
                "[{}] login completed while {}",
                self.provider_kind, self.status
            )));
        }
        self.transition(ContextStatus::Unverified)?;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, cause: impl Into<String>) {
        self.status = ContextStatus::Failed;
        self.verified_at = None;
        self.last_error = Some(cause.into());
    }

    /// Drops freshness so the next request verifies again.
    pub fn invalidate(&mut self) {
        if self.status == ContextStatus::Verified {
            self.status = ContextStatus::Unverified;
        }
        self.verified_at = None;
    }

    /// One-line summary used by status reports.
    pub fn summary(&self) -> String {
        let env = self
            .logical_env
            .as_ref()
            .map(|e| e.as_str())
            .unwrap_or("-");
        let mut out = format!("{} env={env}", self.status);
        if let Some(identity) = &self.current_identity {
            out.push_str(&format!(" identity={identity}"));
        }
        if let Some(err) = &self.last_error {
            out.push_str(&format!(" last_error={err}"));
        }
        out
    }
}

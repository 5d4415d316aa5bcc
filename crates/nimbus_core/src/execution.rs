use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{LogicalEnv, ProviderKind};
use crate::error::NimbusError;

/// Exit status reported for a command that was killed on timeout.
pub const TIMEOUT_EXIT_STATUS: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of child output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub line: String,
}

impl OutputChunk {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            line: line.into(),
        }
    }
}

/// Record of a finished command invocation.
///
/// Only [`ExecutionRecorder::finish`] produces one, so the record cannot
/// change after `ended_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecution {
    pub id: String,
    pub provider_kind: ProviderKind,
    pub logical_env: LogicalEnv,
    pub command_text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_status: Option<i32>,
    pub timed_out: bool,
    pub stdout_sequence: Vec<String>,
    pub stderr_sequence: Vec<String>,
}

impl CommandExecution {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_status == Some(0)
    }

    pub fn stdout(&self) -> String {
        self.stdout_sequence.join("\n")
    }

    pub fn stderr(&self) -> String {
        self.stderr_sequence.join("\n")
    }

    pub fn duration_secs(&self) -> u64 {
        self.ended_at
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0) as u64
    }

    /// Turns a timed-out execution into [`NimbusError::Timeout`].
    ///
    /// A nonzero exit status is left alone; callers decide what it means.
    pub fn check_timeout(self) -> Result<Self, NimbusError> {
        if self.timed_out {
            return Err(NimbusError::Timeout {
                kind: self.provider_kind,
                env: self.logical_env.to_string(),
                secs: self.duration_secs(),
            });
        }
        Ok(self)
    }

    /// Like [`check_timeout`](Self::check_timeout) but also fails on a nonzero exit.
    pub fn require_success(self) -> Result<Self, NimbusError> {
        let this = self.check_timeout()?;
        if this.succeeded() {
            return Ok(this);
        }
        let detail = if this.stderr_sequence.is_empty() {
            this.stdout()
        } else {
            this.stderr()
        };
        Err(NimbusError::CommandFailed {
            kind: this.provider_kind,
            env: this.logical_env.to_string(),
            exit_status: this
                .exit_status
                .map_or_else(|| "none".to_string(), |c| c.to_string()),
            detail: detail.trim().to_string(),
        })
    }

    pub fn to_result(&self) -> CommandResult {
        CommandResult {
            success: self.succeeded(),
            exit_status: self.exit_status,
            stdout: self.stdout(),
            stderr: self.stderr(),
            logical_env: self.logical_env.to_string(),
            provider_kind: self.provider_kind,
        }
    }
}

/// In-flight builder for a [`CommandExecution`].
#[derive(Debug)]
pub struct ExecutionRecorder {
    id: String,
    provider_kind: ProviderKind,
    logical_env: LogicalEnv,
    command_text: String,
    started_at: DateTime<Utc>,
    stdout_sequence: Vec<String>,
    stderr_sequence: Vec<String>,
}

impl ExecutionRecorder {
    pub fn start(
        provider_kind: ProviderKind,
        logical_env: LogicalEnv,
        command_text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider_kind,
            logical_env,
            command_text: command_text.into(),
            started_at: Utc::now(),
            stdout_sequence: Vec::new(),
            stderr_sequence: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn push(&mut self, chunk: OutputChunk) {
        match chunk.stream {
            OutputStream::Stdout => self.stdout_sequence.push(chunk.line),
            OutputStream::Stderr => self.stderr_sequence.push(chunk.line),
        }
    }

    pub fn finish(self, exit_status: Option<i32>, timed_out: bool) -> CommandExecution {
        CommandExecution {
            id: self.id,
            provider_kind: self.provider_kind,
            logical_env: self.logical_env,
            command_text: self.command_text,
            started_at: self.started_at,
            ended_at: Utc::now(),
            exit_status,
            timed_out,
            stdout_sequence: self.stdout_sequence,
            stderr_sequence: self.stderr_sequence,
        }
    }
}

/// Command result shape exposed to callers outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub logical_env: String,
    pub provider_kind: ProviderKind,
}

// ---------------------------------------------------------------------------
// Health reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentStatus {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: Some(detail.into()),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            detail: Some(detail.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// `{<name>: {status, detail?}}`, ordered by name.
pub type StatusReport = BTreeMap<String, ComponentStatus>;

//! A [`CommandRunner`] that replays canned output instead of spawning tools.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::{BroadcastHub, NimbusError, OutputChunk};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::executor::{CommandRunner, CommandSpec};
use crate::stream::{ChunkSink, CommandStream, ExitOutcome, STREAM_BUFFER, StreamEvent};

/// Canned result for one launch.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub chunks: Vec<OutputChunk>,
    pub exit_status: i32,
    /// Simulated run time. Longer than the command timeout means a timeout.
    pub delay: Duration,
    /// Fail at launch instead of producing output.
    pub launch_error: Option<String>,
}

impl ScriptedResponse {
    pub fn stdout(text: &str) -> Self {
        Self {
            chunks: text.lines().map(OutputChunk::stdout).collect(),
            exit_status: 0,
            delay: Duration::ZERO,
            launch_error: None,
        }
    }

    pub fn stderr(text: &str, exit_status: i32) -> Self {
        Self {
            chunks: text.lines().map(OutputChunk::stderr).collect(),
            exit_status,
            delay: Duration::ZERO,
            launch_error: None,
        }
    }

    pub fn launch_failure(cause: &str) -> Self {
        Self {
            chunks: Vec::new(),
            exit_status: 127,
            delay: Duration::ZERO,
            launch_error: Some(cause.to_string()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Rule {
    pattern: String,
    response: ScriptedResponse,
    once: bool,
}

/// What the runner saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Started(String),
    Finished(String),
}

#[derive(Default)]
struct ScriptState {
    rules: VecDeque<Rule>,
    launches: Vec<CommandSpec>,
    events: Vec<LaunchEvent>,
}

/// Matches each launch against registered substrings.
///
/// One-shot rules are consumed in registration order and take priority over
/// persistent ones. A launch matching nothing exits 127.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to the next launch containing `pattern`, once.
    pub fn push(&self, pattern: &str, response: ScriptedResponse) -> &Self {
        self.state.lock().rules.push_back(Rule {
            pattern: pattern.to_string(),
            response,
            once: true,
        });
        self
    }

    /// Respond to every launch containing `pattern`.
    pub fn always(&self, pattern: &str, response: ScriptedResponse) -> &Self {
        self.state.lock().rules.push_back(Rule {
            pattern: pattern.to_string(),
            response,
            once: false,
        });
        self
    }

    /// Command lines launched so far.
    pub fn launches(&self) -> Vec<String> {
        self.state
            .lock()
            .launches
            .iter()
            .map(|s| s.command_text.clone())
            .collect()
    }

    pub fn launched_specs(&self) -> Vec<CommandSpec> {
        self.state.lock().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().launches.len()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .launches
            .iter()
            .filter(|s| s.command_text.contains(pattern))
            .count()
    }

    pub fn events(&self) -> Vec<LaunchEvent> {
        self.state.lock().events.clone()
    }

    fn take_response(&self, command_text: &str) -> Option<ScriptedResponse> {
        let mut state = self.state.lock();
        let once = state
            .rules
            .iter()
            .position(|r| r.once && command_text.contains(&r.pattern));
        if let Some(idx) = once {
            return state.rules.remove(idx).map(|r| r.response);
        }
        state
            .rules
            .iter()
            .find(|r| !r.once && command_text.contains(&r.pattern))
            .map(|r| r.response.clone())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        hub: Option<&BroadcastHub>,
    ) -> Result<CommandStream, NimbusError> {
        let response = self.take_response(&spec.command_text).unwrap_or_else(|| {
            ScriptedResponse::stderr(
                &format!("no scripted response for: {}", spec.command_text),
                127,
            )
        });
        if let Some(cause) = &response.launch_error {
            return Err(spec.launch_error(cause.clone()));
        }
        {
            let mut state = self.state.lock();
            state.launches.push(spec.clone());
            state
                .events
                .push(LaunchEvent::Started(spec.command_text.clone()));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sink = ChunkSink::new(&spec, hub);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let timed_out = response.delay > spec.timeout;
            tokio::time::sleep(response.delay.min(spec.timeout)).await;
            for chunk in response.chunks {
                sink.publish(&chunk);
                if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                    break;
                }
            }
            state
                .lock()
                .events
                .push(LaunchEvent::Finished(spec.command_text.clone()));
            let outcome = if timed_out {
                ExitOutcome::timed_out()
            } else {
                ExitOutcome::exited(response.exit_status)
            };
            let _ = tx.send(StreamEvent::Exit(outcome)).await;
        });
        Ok(CommandStream::new(rx, None))
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::{BroadcastHub, LogicalEnv, NimbusError, OutputStream, ProviderKind};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::{
    ChunkSink, CommandStream, ExitOutcome, STREAM_BUFFER, StreamEvent, read_lines_to_channel,
};

/// Default timeout for command execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Time between SIGTERM and SIGKILL when a command overruns.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Reader tasks still running this long after the child exited are abandoned.
const READER_DRAIN: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Everything a runner needs to launch one command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub provider_kind: ProviderKind,
    pub logical_env: LogicalEnv,
    /// Used to tag streamed chunks.
    pub execution_id: String,
    /// Argument vector handed to the executable as is; `args[0]` is the
    /// executable. No shell is involved.
    pub args: Vec<String>,
    /// `args` joined with spaces, for logs and records.
    pub command_text: String,
    /// Inherited variables that must not reach the child.
    pub env_remove: Vec<String>,
    /// Quiet commands are not mirrored to the broadcast hub.
    pub quiet: bool,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(
        provider_kind: ProviderKind,
        logical_env: LogicalEnv,
        execution_id: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        Self {
            provider_kind,
            logical_env,
            execution_id: execution_id.into(),
            command_text: args.join(" "),
            args,
            env_remove: Vec::new(),
            quiet: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env_remove<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_remove.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    pub(crate) fn launch_error(&self, cause: impl Into<String>) -> NimbusError {
        NimbusError::Launch {
            kind: self.provider_kind,
            env: self.logical_env.to_string(),
            program: self.program().to_string(),
            cause: cause.into(),
        }
    }
}

/// Launches external commands and streams their output.
///
/// A nonzero exit status is reported through the stream's outcome, never as
/// an error. Errors mean the command could not be started at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: CommandSpec,
        hub: Option<&BroadcastHub>,
    ) -> Result<CommandStream, NimbusError>;
}

// ---------------------------------------------------------------------------
// TokioCommandRunner
// ---------------------------------------------------------------------------

/// Runs commands as real child processes, without a shell.
#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        hub: Option<&BroadcastHub>,
    ) -> Result<CommandStream, NimbusError> {
        let program = spec.program();
        if program.is_empty() {
            return Err(spec.launch_error("empty command"));
        }
        if resolve_program(program).is_none() {
            return Err(spec.launch_error("executable not found"));
        }

        debug!(
            kind = %spec.provider_kind,
            env = %spec.logical_env,
            execution_id = %spec.execution_id,
            cmd = %spec.command_text,
            timeout_secs = spec.timeout.as_secs(),
            quiet = spec.quiet,
            "launching command"
        );

        let mut cmd = Command::new(program);
        cmd.args(&spec.args[1..]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in &spec.env_remove {
            cmd.env_remove(name);
        }
        // The tool leads a new process group so termination reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spec.launch_error(e.to_string()))?;
        let process_group = child.id().and_then(|pid| i32::try_from(pid).ok());

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sink = ChunkSink::new(&spec, hub);
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines_to_channel(
                out,
                OutputStream::Stdout,
                sink.clone(),
                tx.clone(),
            )));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines_to_channel(
                err,
                OutputStream::Stderr,
                sink,
                tx.clone(),
            )));
        }

        tokio::spawn(supervise(child, process_group, readers, tx, spec));
        Ok(CommandStream::new(rx, process_group))
    }
}

/// Owns the child until it exits, times out or the consumer goes away.
async fn supervise(
    mut child: Child,
    process_group: Option<i32>,
    mut readers: Vec<tokio::task::JoinHandle<()>>,
    tx: mpsc::Sender<StreamEvent>,
    spec: CommandSpec,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitOutcome { exit_status: exit_code(status), timed_out: false },
            Err(e) => {
                warn!(error = %e, cmd = %spec.command_text, "failed to wait for command");
                ExitOutcome::unknown()
            }
        },
        _ = tokio::time::sleep(spec.timeout) => {
            warn!(
                kind = %spec.provider_kind,
                env = %spec.logical_env,
                cmd = %spec.command_text,
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, terminating process group"
            );
            terminate(&mut child, process_group).await;
            ExitOutcome::timed_out()
        }
        _ = tx.closed() => {
            debug!(cmd = %spec.command_text, "command consumer gone, killing process group");
            kill_now(&mut child, process_group).await;
            for reader in &readers {
                reader.abort();
            }
            return;
        }
    };

    // Pipes close when the child exits; bound the wait in case a descendant
    // inherited them.
    if tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers.iter_mut()))
        .await
        .is_err()
    {
        for reader in &readers {
            reader.abort();
        }
    }
    let _ = tx.send(StreamEvent::Exit(outcome)).await;
}

/// SIGTERM, grace period, then SIGKILL for the whole group.
async fn terminate(child: &mut Child, process_group: Option<i32>) {
    #[cfg(unix)]
    if let Some(pgid) = process_group {
        signal_process_group(pgid, libc::SIGTERM);
        let exited = tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok();
        signal_process_group(pgid, libc::SIGKILL);
        if exited {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = process_group;
    let _ = child.kill().await;
}

async fn kill_now(child: &mut Child, process_group: Option<i32>) {
    #[cfg(unix)]
    if let Some(pgid) = process_group {
        signal_process_group(pgid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = process_group;
    let _ = child.kill().await;
}

/// Send a signal to every process in a group.
#[cfg(unix)]
pub(crate) fn signal_process_group(pgid: i32, signal: i32) {
    if pgid <= 0 {
        return;
    }
    // SAFETY: kill(2) with a negative pid only sends a signal to a process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(pgid, signal, "signal to process group not delivered (already gone)");
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Looks `program` up the way a shell would, without running it.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return is_executable(path).then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nimbus_core::{MessageType, OutputChunk};
    use std::time::Instant;

    fn spec(args: &[&str]) -> CommandSpec {
        CommandSpec::new(
            ProviderKind::Aws,
            LogicalEnv::new("dev").unwrap(),
            "exec-test",
            args.iter().copied(),
        )
    }

    fn process_exists(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn executes_echo() {
        let stream = TokioCommandRunner::new()
            .run(spec(&["echo", "hello"]), None)
            .await
            .unwrap();
        let (chunks, outcome) = stream.collect_all().await;
        assert_eq!(chunks, vec![OutputChunk::stdout("hello")]);
        assert_eq!(outcome, ExitOutcome::exited(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let stream = TokioCommandRunner::new()
            .run(spec(&["sh", "-c", "echo oops >&2; exit 3"]), None)
            .await
            .unwrap();
        let (chunks, outcome) = stream.collect_all().await;
        assert_eq!(outcome.exit_status, Some(3));
        assert!(!outcome.timed_out);
        assert_eq!(chunks, vec![OutputChunk::stderr("oops")]);
    }

    #[tokio::test]
    async fn missing_executable_is_launch_error() {
        let err = TokioCommandRunner::new()
            .run(spec(&["definitely-not-a-real-tool-xyz", "--version"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NimbusError::Launch { .. }), "got: {err}");
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }

    #[tokio::test]
    async fn streams_lines_in_order_to_hub() {
        let hub = BroadcastHub::default();
        let mut sub = hub.subscribe();
        let stream = TokioCommandRunner::new()
            .run(spec(&["printf", "L1\\nL2\\nL3\\n"]), Some(&hub))
            .await
            .unwrap();
        let (chunks, _) = stream.collect_all().await;
        assert_eq!(chunks.len(), 3);

        let mut lines = Vec::new();
        while let Some(msg) = sub.try_recv() {
            assert_eq!(msg.kind, MessageType::CommandOutput);
            assert_eq!(msg.data["execution_id"], "exec-test");
            lines.push(msg.data["line"].as_str().unwrap().to_string());
        }
        assert_eq!(lines, vec!["L1", "L2", "L3"]);
    }

    #[tokio::test]
    async fn quiet_commands_are_not_broadcast() {
        let hub = BroadcastHub::default();
        let mut sub = hub.subscribe();
        let stream = TokioCommandRunner::new()
            .run(spec(&["echo", "secret-token"]).quiet(), Some(&hub))
            .await
            .unwrap();
        let (chunks, _) = stream.collect_all().await;
        assert_eq!(chunks.len(), 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn scrubs_inherited_environment() {
        // SAFETY: test-only mutation; no other test reads this variable.
        unsafe { std::env::set_var("NIMBUS_TEST_SCRUBBED", "leaked") };
        let stream = TokioCommandRunner::new()
            .run(
                spec(&["printenv", "NIMBUS_TEST_SCRUBBED"]).with_env_remove(["NIMBUS_TEST_SCRUBBED"]),
                None,
            )
            .await
            .unwrap();
        let (chunks, outcome) = stream.collect_all().await;
        assert!(chunks.is_empty());
        assert_eq!(outcome.exit_status, Some(1));
    }

    #[tokio::test]
    async fn timeout_kills_long_running_process() {
        let start = Instant::now();
        let stream = TokioCommandRunner::new()
            .run(spec(&["sleep", "10"]).with_timeout(Duration::from_secs(1)), None)
            .await
            .unwrap();
        let pid = stream.process_group().unwrap();
        let (_, outcome) = stream.collect_all().await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_status, Some(nimbus_core::TIMEOUT_EXIT_STATUS));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!process_exists(pid), "child should be terminated");
    }

    #[tokio::test]
    async fn timeout_escalates_to_sigkill() {
        let start = Instant::now();
        let stream = TokioCommandRunner::new()
            .run(
                spec(&["sh", "-c", "trap '' TERM; sleep 10"]).with_timeout(Duration::from_millis(500)),
                None,
            )
            .await
            .unwrap();
        let pid = stream.process_group().unwrap();
        let (_, outcome) = stream.collect_all().await;
        assert!(outcome.timed_out);
        let elapsed = start.elapsed();
        assert!(elapsed >= KILL_GRACE, "should wait out the grace period");
        assert!(elapsed < Duration::from_secs(6));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn dropping_stream_kills_child() {
        let stream = TokioCommandRunner::new()
            .run(spec(&["sleep", "30"]), None)
            .await
            .unwrap();
        let pid = stream.process_group().unwrap();
        assert!(process_exists(pid));
        drop(stream);
        // Give the supervisor a moment to reap.
        let deadline = Instant::now() + Duration::from_secs(3);
        while process_exists(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_exists(pid), "dropped stream must not orphan its child");
    }

    #[test]
    fn resolves_programs_on_path() {
        assert!(resolve_program("sh").is_some());
        assert!(resolve_program("no-such-binary-nimbus").is_none());
        assert!(resolve_program("/bin/sh").is_some() || resolve_program("/usr/bin/sh").is_some());
    }

    #[test]
    fn spec_program_is_first_arg() {
        let s = spec(&["aws", "s3", "ls"]);
        assert_eq!(s.program(), "aws");
        assert_eq!(s.command_text, "aws s3 ls");
        assert_eq!(spec(&[]).program(), "");
    }

    #[tokio::test]
    async fn arguments_reach_the_tool_without_shell_expansion() {
        let stream = TokioCommandRunner::new()
            .run(spec(&["echo", "$HOME", "*", "'--pro''file'", "my file"]), None)
            .await
            .unwrap();
        let (chunks, outcome) = stream.collect_all().await;
        assert_eq!(outcome, ExitOutcome::exited(0));
        assert_eq!(chunks, vec![OutputChunk::stdout("$HOME * '--pro''file' my file")]);
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_truncate_output() {
        let stream = TokioCommandRunner::new()
            .run(spec(&["printf", "L1\\nbad\\377\\nL3\\n"]), None)
            .await
            .unwrap();
        let (chunks, outcome) = stream.collect_all().await;
        assert_eq!(outcome, ExitOutcome::exited(0));
        assert_eq!(
            chunks,
            vec![
                OutputChunk::stdout("L1"),
                OutputChunk::stdout("bad\u{FFFD}"),
                OutputChunk::stdout("L3"),
            ]
        );
    }
}

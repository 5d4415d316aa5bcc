use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use nimbus_core::{BroadcastHub, BroadcastMessage, ExecutionRecorder, OutputChunk};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::executor::CommandSpec;

/// Buffered chunks between reader tasks and the consumer.
pub(crate) const STREAM_BUFFER: usize = 256;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// `None` when the process ended without a status we could read.
    pub exit_status: Option<i32>,
    pub timed_out: bool,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_status: Some(code),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_status: Some(nimbus_core::TIMEOUT_EXIT_STATUS),
            timed_out: true,
        }
    }

    pub fn unknown() -> Self {
        Self {
            exit_status: None,
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_status == Some(0)
    }
}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Chunk(OutputChunk),
    Exit(ExitOutcome),
}

/// Where the stream's chunks are mirrored as they are produced.
#[derive(Clone)]
pub(crate) struct ChunkSink {
    hub: Option<BroadcastHub>,
    spec: std::sync::Arc<CommandSpec>,
}

impl ChunkSink {
    pub(crate) fn new(spec: &CommandSpec, hub: Option<&BroadcastHub>) -> Self {
        Self {
            hub: if spec.quiet { None } else { hub.cloned() },
            spec: std::sync::Arc::new(spec.clone()),
        }
    }

    pub(crate) fn publish(&self, chunk: &OutputChunk) {
        if let Some(hub) = &self.hub {
            hub.publish(BroadcastMessage::command_output(
                self.spec.provider_kind,
                &self.spec.logical_env,
                &self.spec.execution_id,
                chunk.stream,
                &chunk.line,
            ));
        }
    }
}

/// Lazy, finite stream of output lines from one command.
///
/// Yields chunks until the command ends, after which [`outcome`](Self::outcome)
/// holds the exit status. Cannot be restarted. Dropping it before the end
/// kills the child's process group.
#[derive(Debug)]
pub struct CommandStream {
    rx: mpsc::Receiver<StreamEvent>,
    outcome: Option<ExitOutcome>,
    process_group: Option<i32>,
}

impl CommandStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, process_group: Option<i32>) -> Self {
        Self {
            rx,
            outcome: None,
            process_group,
        }
    }

    /// Exit outcome, available once the stream has ended.
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome
    }

    /// Process group id of the child, when the runner spawned a real process.
    pub fn process_group(&self) -> Option<i32> {
        self.process_group
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        futures::StreamExt::next(self).await
    }

    /// Drains the stream into `recorder` and returns the outcome.
    pub async fn record_into(mut self, recorder: &mut ExecutionRecorder) -> ExitOutcome {
        while let Some(chunk) = self.next_chunk().await {
            recorder.push(chunk);
        }
        self.outcome.unwrap_or_else(ExitOutcome::unknown)
    }

    /// Drains the stream, returning every chunk and the outcome.
    pub async fn collect_all(mut self) -> (Vec<OutputChunk>, ExitOutcome) {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk);
        }
        (chunks, self.outcome.unwrap_or_else(ExitOutcome::unknown))
    }
}

impl Stream for CommandStream {
    type Item = OutputChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.outcome.is_some() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Chunk(chunk))) => Poll::Ready(Some(chunk)),
            Poll::Ready(Some(StreamEvent::Exit(outcome))) => {
                this.outcome = Some(outcome);
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.outcome = Some(ExitOutcome::unknown());
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(pgid) = self.process_group {
            debug!(pgid, "command stream dropped before completion, killing process group");
            #[cfg(unix)]
            crate::executor::signal_process_group(pgid, libc::SIGKILL);
        }
    }
}

/// Reads lines from a child pipe, mirroring each to the hub before handing it on.
///
/// Bytes that are not valid UTF-8 are replaced, so one bad byte never ends
/// the read and the pipe keeps draining.
pub(crate) async fn read_lines_to_channel<R>(
    reader: R,
    stream: nimbus_core::OutputStream,
    sink: ChunkSink,
    tx: mpsc::Sender<StreamEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut reader = tokio::io::BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = OutputChunk {
                    stream,
                    line: decode_line(&buf),
                };
                sink.publish(&chunk);
                if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                    // Consumer dropped; stop reading.
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, stream = stream.as_str(), "error reading command output");
                break;
            }
        }
    }
}

/// One line without its `\n` or `\r\n` terminator.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

//! Execution backends.
//!
//! A backend starts the process described by a [`RunDescriptor`] and hands
//! back a [`ProcessHandle`]: a one-shot stream of output lines, a future that
//! resolves with how the process ended, and a token that asks it to stop.
//! The lifecycle controller only talks to this contract.

pub mod local;
pub mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

use crate::ssh::SshError;
use simrun_core::{FailureReason, OutputLine, OutputSource, RemoteTarget, RunDescriptor};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lines buffered between the pipe readers and the controller.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Longest line kept verbatim; the rest of the line is dropped.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to start {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Connection(#[from] SshError),
}

impl BackendError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Launch { .. } => FailureReason::Launch {
                message: self.to_string(),
            },
            Self::Connection(err) => FailureReason::Connection {
                cause: err.cause(),
                message: err.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// How a started process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own before any stop request was acted on.
    Exited(i32),
    /// Ended after a stop request. `forced` when the grace period ran out.
    Terminated { code: i32, forced: bool },
    /// The process or its transport vanished without an exit status.
    Lost(String),
}

/// Output lines in arrival order. Can be consumed once.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<OutputLine>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    output: Option<OutputStream>,
    exit: JoinHandle<ProcessExit>,
    terminate: CancellationToken,
}

impl ProcessHandle {
    fn new(
        pid: Option<u32>,
        output: OutputStream,
        exit: JoinHandle<ProcessExit>,
        terminate: CancellationToken,
    ) -> Self {
        Self {
            pid,
            output: Some(output),
            exit,
            terminate,
        }
    }

    /// Local pid of the launched process (the ssh client for remote runs).
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output stream. Returns `None` on the second call.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Token that asks the process to stop: polite signal first, forced kill
    /// after the grace period.
    pub fn terminator(&self) -> CancellationToken {
        self.terminate.clone()
    }

    pub async fn wait(self) -> ProcessExit {
        match self.exit.await {
            Ok(exit) => exit,
            Err(err) => ProcessExit::Lost(format!("process supervisor failed: {err}")),
        }
    }
}

/// Backend selected for a run's target.
#[derive(Debug, Clone, Copy)]
pub enum ExecutionBackend<'a> {
    Local(&'a LocalBackend),
    Remote(&'a RemoteBackend, &'a RemoteTarget),
}

impl ExecutionBackend<'_> {
    /// Remote runs pass through `Connecting` before they run.
    pub fn connects_first(&self) -> bool {
        matches!(self, Self::Remote(..))
    }

    pub async fn start(&self, descriptor: &RunDescriptor) -> Result<ProcessHandle> {
        match self {
            Self::Local(backend) => backend.start(descriptor),
            Self::Remote(backend, target) => backend.start(descriptor, target).await,
        }
    }
}

fn output_channel() -> (mpsc::Sender<OutputLine>, OutputStream) {
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    (tx, OutputStream { rx })
}

/// Forward lines from `reader` until EOF. Keeps draining after the receiver
/// goes away so the writer never blocks on a full pipe.
fn spawn_line_pump<R>(reader: R, source: OutputSource, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if !forwarding {
                        continue;
                    }
                    buf.truncate(MAX_LINE_BYTES);
                    let line = OutputLine {
                        source,
                        text: String::from_utf8_lossy(&buf).into_owned(),
                    };
                    if tx.send(line).await.is_err() {
                        forwarding = false;
                    }
                }
                Err(err) => {
                    debug!(source = source.as_str(), error = %err, "output pipe read failed");
                    break;
                }
            }
        }
    })
}

/// Exit code, or `128 + signal` for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_pump_splits_and_strips_line_endings() {
        let (tx, mut stream) = output_channel();
        let input: &[u8] = b"first\r\nsecond\nno newline at end";
        spawn_line_pump(input, OutputSource::Stdout, tx);

        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            assert_eq!(line.source, OutputSource::Stdout);
            lines.push(line.text);
        }
        assert_eq!(lines, vec!["first", "second", "no newline at end"]);
    }

    #[tokio::test]
    async fn line_pump_drains_after_receiver_drops() {
        let (tx, stream) = output_channel();
        drop(stream);
        let input: &[u8] = b"a\nb\nc\n";
        let pump = spawn_line_pump(input, OutputSource::Stderr, tx);
        pump.await.unwrap();
    }

    #[test]
    fn launch_error_maps_to_launch_reason() {
        let err = BackendError::Launch {
            program: "no-such-solver".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let reason = err.failure_reason();
        assert_eq!(reason.category(), "launch");
        assert!(reason.describe().contains("no-such-solver"));
    }
}

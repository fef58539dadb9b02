//! Remote execution over a pooled SSH session.
//!
//! The run is a channel on the session's master connection with a forced
//! pty. Stopping writes an interrupt (`^C`) to the pty, which delivers
//! SIGINT to the remote foreground process group; if the process is still
//! alive after the grace period the channel is torn down, which hangs up the
//! remote side.

use super::{exit_code, output_channel, spawn_line_pump, ProcessExit, ProcessHandle, Result};
use crate::ssh::{SessionLease, SshError, SshManager};
use simrun_core::{OutputSource, RemoteTarget, RunDescriptor};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// OpenSSH reserves this status for its own errors.
const SSH_TRANSPORT_ERROR: i32 = 255;

const INTERRUPT: u8 = 0x03;

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    ssh: Arc<SshManager>,
    grace: Duration,
}

impl RemoteBackend {
    pub fn new(ssh: Arc<SshManager>, grace: Duration) -> Self {
        Self { ssh, grace }
    }

    pub fn ssh(&self) -> &Arc<SshManager> {
        &self.ssh
    }

    pub async fn start(&self, descriptor: &RunDescriptor, target: &RemoteTarget) -> Result<ProcessHandle> {
        let lease = self.ssh.acquire(target).await?;
        let script = remote_command(descriptor);

        let mut cmd = lease.command(&script);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(remote = %target, command = %script, "opening remote channel");

        let mut child = cmd.spawn().map_err(|source| SshError::Spawn {
            program: cmd.as_std().get_program().to_string_lossy().into_owned(),
            source,
        })?;
        let pid = child.id();

        let (tx, output) = output_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, OutputSource::Stdout, tx.clone());
        }
        // With a pty the remote stderr arrives on stdout; this carries the
        // local client's own diagnostics.
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, OutputSource::Stderr, tx);
        }
        let stdin = child.stdin.take();

        let terminate = CancellationToken::new();
        let exit = tokio::spawn(supervise(child, stdin, lease, terminate.clone(), self.grace));
        Ok(ProcessHandle::new(pid, output, exit, terminate))
    }
}

async fn supervise(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    lease: SessionLease,
    terminate: CancellationToken,
    grace: Duration,
) -> ProcessExit {
    let remote = lease.session().target().clone();

    let natural = tokio::select! {
        biased;
        status = child.wait() => Some(status),
        () = terminate.cancelled() => None,
    };

    let exit = match natural {
        Some(Ok(status)) => {
            let code = exit_code(status);
            if status.code() == Some(SSH_TRANSPORT_ERROR) || status.code().is_none() {
                ProcessExit::Lost(format!("ssh session to {remote} closed unexpectedly (status {code})"))
            } else {
                ProcessExit::Exited(code)
            }
        }
        Some(Err(err)) => ProcessExit::Lost(format!("failed to wait for ssh client: {err}")),
        None => {
            debug!(remote = %remote, "sending interrupt to remote process");
            if let Some(stdin) = stdin.as_mut() {
                if let Err(err) = stdin.write_all(&[INTERRUPT]).await {
                    debug!(remote = %remote, error = %err, "failed to write interrupt");
                }
                if let Err(err) = stdin.flush().await {
                    debug!(remote = %remote, error = %err, "failed to flush interrupt");
                }
            }
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => ProcessExit::Terminated {
                    code: exit_code(status),
                    forced: false,
                },
                Ok(Err(err)) => ProcessExit::Lost(format!("failed to wait for ssh client: {err}")),
                Err(_) => {
                    warn!(
                        remote = %remote,
                        grace_ms = grace.as_millis(),
                        "remote process ignored interrupt; closing channel"
                    );
                    if let Err(err) = child.kill().await {
                        debug!(remote = %remote, error = %err, "failed to kill ssh client");
                    }
                    match child.wait().await {
                        Ok(status) => ProcessExit::Terminated {
                            code: exit_code(status),
                            forced: true,
                        },
                        Err(err) => ProcessExit::Lost(format!("failed to wait for ssh client: {err}")),
                    }
                }
            }
        }
    };

    drop(stdin);
    drop(lease);
    exit
}

/// `cd <dir> && exec [env K=V ...] <program> <args...>` with every word quoted
/// for a POSIX shell.
pub fn remote_command(descriptor: &RunDescriptor) -> String {
    let mut words = vec!["exec".to_string()];
    if !descriptor.env.is_empty() {
        words.push("env".to_string());
        words.extend(
            descriptor
                .env
                .iter()
                .map(|(k, v)| shell_quote(&format!("{k}={v}"))),
        );
    }
    words.push(shell_quote(&descriptor.executable.program));
    words.extend(descriptor.executable.args.iter().map(|a| shell_quote(a)));
    format!(
        "cd {} && {}",
        shell_quote(&descriptor.working_directory.to_string_lossy()),
        words.join(" ")
    )
}

/// Quote a word for a POSIX shell. Plain words pass through unchanged.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

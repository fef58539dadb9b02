//! Local process execution.
//!
//! Each run gets its own process group so a stop request reaches the whole
//! tree the program spawns: SIGTERM to the group, then SIGKILL once the grace
//! period runs out.

use super::{exit_code, output_channel, spawn_line_pump, BackendError, ProcessExit, ProcessHandle, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use simrun_core::{OutputSource, RunDescriptor};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    grace: Duration,
}

impl LocalBackend {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn start(&self, descriptor: &RunDescriptor) -> Result<ProcessHandle> {
        let exe = &descriptor.executable;
        let mut cmd = Command::new(&exe.program);
        cmd.args(&exe.args)
            .current_dir(&descriptor.working_directory)
            .envs(&descriptor.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!(
            program = %exe.program,
            args = ?exe.args,
            working_dir = %descriptor.working_directory.display(),
            "spawning local process"
        );

        let mut child = cmd.spawn().map_err(|source| BackendError::Launch {
            program: exe.program.clone(),
            source,
        })?;
        let pid = child.id();

        let (tx, output) = output_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, OutputSource::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, OutputSource::Stderr, tx);
        }

        let terminate = CancellationToken::new();
        let exit = tokio::spawn(supervise(child, pid, terminate.clone(), self.grace));
        Ok(ProcessHandle::new(pid, output, exit, terminate))
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    terminate: CancellationToken,
    grace: Duration,
) -> ProcessExit {
    // Natural exit wins when both are ready.
    tokio::select! {
        biased;
        status = child.wait() => {
            return match status {
                Ok(status) => ProcessExit::Exited(exit_code(status)),
                Err(err) => ProcessExit::Lost(format!("failed to wait for process: {err}")),
            };
        }
        () = terminate.cancelled() => {}
    }

    debug!(?pid, "sending SIGTERM to process group");
    signal_group(pid, Signal::SIGTERM);

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => ProcessExit::Terminated {
            code: exit_code(status),
            forced: false,
        },
        Ok(Err(err)) => ProcessExit::Lost(format!("failed to wait for process: {err}")),
        Err(_) => {
            warn!(
                ?pid,
                grace_ms = grace.as_millis(),
                "process ignored SIGTERM; sending SIGKILL"
            );
            signal_group(pid, Signal::SIGKILL);
            if let Err(err) = child.start_kill() {
                debug!(?pid, error = %err, "direct kill failed");
            }
            match child.wait().await {
                Ok(status) => ProcessExit::Terminated {
                    code: exit_code(status),
                    forced: true,
                },
                Err(err) => ProcessExit::Lost(format!("failed to wait for process: {err}")),
            }
        }
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!(pid, signal = signal.as_str(), error = %err, "killpg failed");
    }
}

//! simrunctl - CLI client for simrund.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, SubmitRunRequest};
use simrun_core::{
    ExecutableSpec, ListScope, NotificationChannel, NotificationPreference, RemoteTarget,
    RunDescriptor, RunState, Target, TriggerPolicy,
};
use std::path::PathBuf;
use std::time::Duration;

/// CLI client for the simrund run orchestrator.
#[derive(Debug, Parser)]
#[command(name = "simrunctl")]
#[command(about = "Submit and track simulation runs")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "SIMRUND_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "SIMRUND_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a run: simrunctl submit [options] -- <program> <args...>
    Submit(SubmitArgs),

    /// List runs
    List {
        /// active, terminal, or all
        #[arg(long, default_value = "all", value_parser = parse_scope)]
        scope: ListScope,
    },

    /// Show the full record of a run
    Status {
        /// Run ID
        run_id: String,
    },

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Remove a finished run from the daemon
    Purge {
        /// Run ID
        run_id: String,
    },

    /// Stream a run's output and state changes until it finishes
    Watch {
        /// Run ID
        run_id: String,
    },
}

#[derive(Debug, clap::Args)]
struct SubmitArgs {
    /// Working directory (default: current directory)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Host alias from the SSH client config
    #[arg(long, conflicts_with = "remote")]
    host: Option<String>,

    /// Remote target as user@host
    #[arg(long)]
    remote: Option<String>,

    /// Private key for --remote
    #[arg(long, requires = "remote")]
    key: Option<PathBuf>,

    /// SSH port for --remote
    #[arg(long, requires = "remote")]
    port: Option<u16>,

    /// Wall-clock limit in seconds
    #[arg(long)]
    timeout_sec: Option<u64>,

    /// Email address to notify (repeatable)
    #[arg(long)]
    email: Vec<String>,

    /// ntfy topic to notify (repeatable)
    #[arg(long)]
    topic: Vec<String>,

    /// When to notify: on_success, on_failure, or always
    #[arg(long, default_value = "always", value_parser = parse_trigger)]
    notify: TriggerPolicy,

    /// Display label
    #[arg(long)]
    label: Option<String>,

    /// Extra environment as KEY=VALUE (repeatable)
    #[arg(long, value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Output substring to flag as an error marker (repeatable)
    #[arg(long)]
    marker: Vec<String>,

    /// Follow the run after submitting
    #[arg(long)]
    watch: bool,

    /// Program and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_scope(s: &str) -> Result<ListScope, String> {
    s.parse()
}

fn parse_trigger(s: &str) -> Result<TriggerPolicy, String> {
    s.parse()
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn parse_remote(s: &str) -> Result<RemoteTarget, ClientError> {
    let (user, host) = s
        .split_once('@')
        .ok_or_else(|| ClientError::InvalidArgument(format!("--remote expects user@host, got '{s}'")))?;
    Ok(RemoteTarget::new(host, user))
}

impl SubmitArgs {
    fn into_request(self) -> Result<SubmitRunRequest, ClientError> {
        let mut command = self.command.into_iter();
        let program = command.next().unwrap_or_default();
        let executable = ExecutableSpec::new(program, command);

        let target = match &self.remote {
            Some(remote) => {
                let mut target = parse_remote(remote)?;
                if let Some(key) = self.key {
                    target = target.with_key(key);
                }
                if let Some(port) = self.port {
                    target = target.with_port(port);
                }
                Target::Remote(target)
            }
            None => Target::Local,
        };

        let dir = match self.dir {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|e| ClientError::IoError(e.to_string()))?,
        };
        // Relative paths only make sense on this machine.
        let dir = if dir.is_relative() && !target.is_remote() && self.host.is_none() {
            std::path::absolute(&dir).map_err(|e| ClientError::IoError(e.to_string()))?
        } else {
            dir
        };

        let mut descriptor = RunDescriptor::new(executable, dir, target).with_error_markers(self.marker);
        if let Some(secs) = self.timeout_sec {
            descriptor = descriptor.with_timeout(Duration::from_secs(secs));
        }
        if let Some(label) = self.label {
            descriptor = descriptor.with_label(label);
        }
        for (key, value) in self.env {
            descriptor = descriptor.with_env(key, value);
        }

        let channels: Vec<NotificationChannel> = self
            .email
            .into_iter()
            .map(NotificationChannel::Email)
            .chain(self.topic.into_iter().map(NotificationChannel::Topic))
            .collect();
        if !channels.is_empty() {
            descriptor = descriptor.with_notification(NotificationPreference {
                channels,
                trigger: self.notify,
            });
        }

        Ok(SubmitRunRequest {
            descriptor,
            host_alias: self.host,
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7710".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Submit(args) => run_submit(&client, args).await,
        Command::List { scope } => run_list(&client, scope).await,
        Command::Status { run_id } => run_status(&client, &run_id).await,
        Command::Cancel { run_id } => run_cancel(&client, &run_id).await,
        Command::Purge { run_id } => run_purge(&client, &run_id).await,
        Command::Watch { run_id } => run_watch(&client, &run_id).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

/// Exit status for a finished run: 0 only when it succeeded.
fn exit_status(state: Option<RunState>) -> i32 {
    match state {
        Some(RunState::Succeeded) => 0,
        _ => 1,
    }
}

async fn run_submit(client: &Client, args: SubmitArgs) -> Result<i32, ClientError> {
    let watch = args.watch;
    let request = args.into_request()?;
    let run_id = client.submit_run(&request).await?;
    render::print_run_submitted(&run_id);
    if watch {
        return run_watch(client, &run_id.0).await;
    }
    Ok(0)
}

async fn run_list(client: &Client, scope: ListScope) -> Result<i32, ClientError> {
    let runs = client.list_runs(scope).await?;
    render::print_run_list(&runs);
    Ok(0)
}

async fn run_status(client: &Client, run_id: &str) -> Result<i32, ClientError> {
    let run = client.get_run(run_id).await?;
    render::print_run_details(&run);
    Ok(0)
}

async fn run_cancel(client: &Client, run_id: &str) -> Result<i32, ClientError> {
    let response = client.cancel_run(run_id).await?;
    if response.outcome == "already_completed" {
        println!("Run {run_id} already finished: {}", response.state);
    } else {
        println!("Cancellation requested for run {run_id}");
    }
    Ok(0)
}

async fn run_purge(client: &Client, run_id: &str) -> Result<i32, ClientError> {
    let run = client.purge_run(run_id).await?;
    println!("Purged run {} ({})", run.id, run.state);
    Ok(0)
}

async fn run_watch(client: &Client, run_id: &str) -> Result<i32, ClientError> {
    let state = client.watch_run(run_id, render::print_event).await?;
    Ok(exit_status(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(args: &[&str]) -> SubmitArgs {
        let cli = Cli::try_parse_from(std::iter::once("simrunctl").chain(args.iter().copied())).unwrap();
        match cli.command {
            Command::Submit(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn builds_remote_request_with_notifications() {
        let request = submit(&[
            "submit",
            "--remote",
            "sim@hpc.example.org",
            "--port",
            "2222",
            "--dir",
            "/scratch/h2o",
            "--timeout-sec",
            "3600",
            "--email",
            "user@example.com",
            "--topic",
            "h2o-runs",
            "--notify",
            "on_failure",
            "--env",
            "OMP_NUM_THREADS=8",
            "--",
            "astra",
            "-v",
            "in.inp",
        ])
        .into_request()
        .unwrap();

        let d = &request.descriptor;
        assert_eq!(d.executable, ExecutableSpec::new("astra", ["-v", "in.inp"]));
        assert_eq!(
            d.target,
            Target::Remote(RemoteTarget::new("hpc.example.org", "sim").with_port(2222))
        );
        assert_eq!(d.timeout_ms, Some(3_600_000));
        assert_eq!(d.notification.trigger, TriggerPolicy::OnFailure);
        assert_eq!(d.notification.channels.len(), 2);
        assert_eq!(d.env.get("OMP_NUM_THREADS").map(String::as_str), Some("8"));
        assert!(request.host_alias.is_none());
    }

    #[test]
    fn host_alias_is_passed_through() {
        let request = submit(&["submit", "--host", "hpc", "--dir", "/scratch", "astra", "in.inp"])
            .into_request()
            .unwrap();
        assert_eq!(request.host_alias.as_deref(), Some("hpc"));
        assert_eq!(request.descriptor.target, Target::Local);
        assert!(request.descriptor.notification.is_empty());
    }

    #[test]
    fn rejects_malformed_remote_and_env() {
        assert!(parse_remote("hpc.example.org").is_err());
        assert!(parse_env("NOVALUE").is_err());
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".to_string(), "b=c".to_string()));
    }

    #[test]
    fn exit_status_follows_final_state() {
        assert_eq!(exit_status(Some(RunState::Succeeded)), 0);
        assert_eq!(exit_status(Some(RunState::Failed)), 1);
        assert_eq!(exit_status(None), 1);
    }
}

//! simrund - simulation run orchestrator daemon.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::{eyre, WrapErr};
use simrun_core::Config;
use simrund::{Daemon, DaemonConfig, DEFAULT_PORT};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "simrund", about = "Simulation run orchestrator daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bearer token required on API requests
    #[arg(long, env = "SIMRUND_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Config file, merged over ~/.config/simrun/config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ntfy server base URL
    #[arg(long)]
    ntfy_server: Option<String>,

    /// Grace period between the stop request and the forced kill
    #[arg(long)]
    cancel_grace_ms: Option<u64>,

    /// How long finished runs stay queryable
    #[arg(long)]
    retention_sec: Option<u64>,
}

impl Cli {
    fn settings(&self) -> eyre::Result<Config> {
        let mut settings = Config::load_default().wrap_err("failed to load user config")?;
        if let Some(path) = &self.config {
            settings
                .load_file(path)
                .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
        }
        if let Some(server) = &self.ntfy_server {
            settings.ntfy_server.clone_from(server);
        }
        if let Some(grace) = self.cancel_grace_ms {
            settings.cancel_grace_ms = grace;
        }
        if let Some(retention) = self.retention_sec {
            settings.retention_sec = retention;
        }
        Ok(settings)
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig {
        port: cli.port,
        auth_token: cli.auth_token.clone(),
        settings: cli.settings()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config).wrap_err("failed to initialize daemon")?;

        let mut sigterm =
            signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

        let run = daemon.run();
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
                daemon.shutdown();
                run.await
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
                daemon.shutdown();
                run.await
            }
        };

        result.map_err(|e| {
            error!("daemon error: {}", e);
            eyre!("daemon error: {e}")
        })
    })
}

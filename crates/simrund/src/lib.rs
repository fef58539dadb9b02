//! simrund - simulation run orchestrator daemon.
//!
//! Library components for the daemon process: execution backends, the SSH
//! session pool, per-run controllers, the run registry, notifications, and
//! the HTTP control plane.

pub mod backend;
pub mod controller;
pub mod notify;
pub mod registry;
pub mod server;
pub mod ssh;

use std::sync::Arc;

use registry::{RegistryError, RunRegistry};
use server::AppState;
use simrun_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP server port.
    pub port: u16,
    /// Bearer token for the HTTP API (optional).
    pub auth_token: Option<String>,
    pub settings: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auth_token: std::env::var("SIMRUND_AUTH_TOKEN").ok(),
            settings: Config::default(),
        }
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<RunRegistry>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self, RegistryError> {
        let registry = Arc::new(RunRegistry::from_config(&config.settings)?);
        Ok(Self {
            config,
            registry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Serve the API and run periodic maintenance until [`Self::shutdown`].
    /// Active runs are cancelled and SSH sessions closed before returning.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let settings = &self.config.settings;
        info!("simrund starting on port {}", self.config.port);
        info!("ssh control dir: {}", settings.ssh_control_dir.display());
        info!("run retention: {}s", settings.retention_sec);
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            config: Arc::new(settings.clone()),
            auth_token: self.config.auth_token.clone(),
        });
        let mut http = tokio::spawn(server::start_server(
            state,
            self.config.port,
            self.shutdown.clone(),
        ));

        let mut maintenance = tokio::time::interval(settings.maintenance_interval());
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut server_result = None;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                joined = &mut http => {
                    server_result = Some(joined);
                    break;
                }
                _ = maintenance.tick() => {
                    self.registry.purge_expired();
                    let evicted = self.registry.ssh().evict_idle().await;
                    if evicted > 0 {
                        info!("closed {} idle ssh session(s)", evicted);
                    }
                }
            }
        }

        let cancelled = self.registry.cancel_all().await;
        if cancelled > 0 {
            info!("cancelled {} active run(s)", cancelled);
        }
        let closed = self.registry.ssh().close_all().await;
        if closed > 0 {
            info!("closed {} ssh session(s)", closed);
        }

        let joined = match server_result {
            Some(joined) => joined,
            None => {
                self.shutdown.cancel();
                http.await
            }
        };
        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("HTTP server task failed: {}", e);
                Err(Box::new(e))
            }
        }
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}

//! SSH session pool built on OpenSSH connection multiplexing.
//!
//! One authenticated master connection (`ssh -M -N`) per pooled session;
//! each run opens a channel over it through the control socket. A session
//! carries at most `max_channels_per_session` runs, and a target keeps at
//! most `max_sessions_per_target` sessions before channels are packed onto
//! the least-loaded one.
//!
//! Pools are locked per target so connecting to a slow host never blocks
//! runs headed elsewhere.

use sha2::{Digest, Sha256};
use simrun_core::{Config, ConnectionCause, RemoteTarget};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How often the control socket is polled while a master connects.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra time on top of `ConnectTimeout` before giving up on a master.
const CONNECT_SLACK: Duration = Duration::from_secs(2);

/// Upper bound for `ssh -O check` and `ssh -O exit`.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay between connection attempts; grows linearly per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Stderr lines kept from a master for error reporting.
const STDERR_KEEP_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to launch ssh client `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh connection to {target} failed ({cause}): {message}")]
    Connect {
        target: String,
        cause: ConnectionCause,
        message: String,
    },
    #[error("failed to prepare control directory {path}: {source}")]
    ControlDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SshError {
    pub fn cause(&self) -> ConnectionCause {
        match self {
            Self::Connect { cause, .. } => *cause,
            Self::Spawn { .. } | Self::ControlDir { .. } => ConnectionCause::Other,
        }
    }

    /// Authentication and resolution failures will not fix themselves.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect {
                cause: ConnectionCause::Timeout | ConnectionCause::Other,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, SshError>;

#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Client command prefix; the first element is the program.
    pub command: Vec<String>,
    pub control_dir: PathBuf,
    pub connect_timeout: Duration,
    pub connect_retries: u32,
    pub idle_timeout: Duration,
    pub max_channels_per_session: usize,
    pub max_sessions_per_target: usize,
    pub strict_host_key_checking: bool,
}

impl SshSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.ssh_command.clone(),
            control_dir: config.ssh_control_dir.clone(),
            connect_timeout: Duration::from_secs(config.ssh_connect_timeout_sec.max(1)),
            connect_retries: config.ssh_connect_retries,
            idle_timeout: Duration::from_secs(config.ssh_idle_timeout_sec),
            max_channels_per_session: config.ssh_max_channels_per_session.max(1),
            max_sessions_per_target: config.ssh_max_sessions_per_target.max(1),
            strict_host_key_checking: config.ssh_strict_host_key_checking,
        }
    }

    fn program(&self) -> &str {
        self.command.first().map_or("ssh", String::as_str)
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.command.iter().skip(1));
        cmd
    }
}

/// One multiplexing master connection.
#[derive(Debug)]
pub struct SshSession {
    target: RemoteTarget,
    control_path: PathBuf,
    settings: Arc<SshSettings>,
    master: Mutex<Option<Child>>,
    leases: AtomicUsize,
    last_used: StdMutex<Instant>,
}

impl SshSession {
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn lease(self: &Arc<Self>) -> SessionLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.touch();
        SessionLease {
            session: Arc::clone(self),
        }
    }

    /// `ssh -S <socket> -p <port> -l <user> <host>` plus the control options.
    fn control_command(&self) -> Command {
        let mut cmd = self.settings.base_command();
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg("-l")
            .arg(&self.target.user);
        cmd
    }

    async fn master_alive(&self) -> bool {
        let mut master = self.master.lock().await;
        match master.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Master is running and answers `-O check`.
    async fn is_healthy(&self) -> bool {
        self.master_alive().await && check_control(&self.settings, &self.control_path, &self.target).await
    }

    async fn close(&self) {
        let mut cmd = self.control_command();
        cmd.args(["-O", "exit"])
            .arg(&self.target.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Ok(Err(err)) = timeout(CONTROL_TIMEOUT, cmd.status()).await {
            debug!(remote = %self.target, error = %err, "ssh -O exit failed");
        }
        if let Some(mut child) = self.master.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(remote = %self.target, error = %err, "failed to kill ssh master");
            }
        }
        if let Err(err) = std::fs::remove_file(&self.control_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.control_path.display(), error = %err, "failed to remove control socket");
            }
        }
        info!(remote = %self.target, "ssh session closed");
    }
}

/// A run's claim on a channel of a pooled session. Dropping it releases the
/// channel.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<SshSession>,
}

impl SessionLease {
    pub fn session(&self) -> &SshSession {
        &self.session
    }

    /// Command that runs `remote_command` on the target over this session,
    /// with a forced pty so an interrupt reaches the remote process group.
    pub fn command(&self, remote_command: &str) -> Command {
        let mut cmd = self.session.control_command();
        cmd.args(["-o", "ControlMaster=no", "-tt"])
            .arg(&self.session.target.host)
            .arg(remote_command);
        cmd
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.leases.fetch_sub(1, Ordering::SeqCst);
        self.session.touch();
    }
}

#[derive(Debug, Default)]
struct TargetPool {
    sessions: Vec<Arc<SshSession>>,
}

#[derive(Debug)]
pub struct SshManager {
    settings: Arc<SshSettings>,
    pools: StdMutex<HashMap<RemoteTarget, Arc<Mutex<TargetPool>>>>,
    next_session: AtomicU64,
}

impl SshManager {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            pools: StdMutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(SshSettings::from_config(config))
    }

    fn pool_for(&self, target: &RemoteTarget) -> Arc<Mutex<TargetPool>> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pools.entry(target.clone()).or_default())
    }

    fn all_pools(&self) -> Vec<Arc<Mutex<TargetPool>>> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect()
    }

    /// Lease a channel on a healthy session for `target`, connecting a new
    /// session when none has room.
    pub async fn acquire(&self, target: &RemoteTarget) -> Result<SessionLease> {
        let pool = self.pool_for(target);
        let mut pool = pool.lock().await;

        let mut idx = 0;
        while idx < pool.sessions.len() {
            let session = &pool.sessions[idx];
            if session.active_leases() >= self.settings.max_channels_per_session {
                idx += 1;
                continue;
            }
            if session.is_healthy().await {
                debug!(remote = %target, leases = session.active_leases(), "reusing ssh session");
                return Ok(session.lease());
            }
            warn!(remote = %target, "discarding unhealthy ssh session");
            let dead = pool.sessions.remove(idx);
            dead.close().await;
        }

        while pool.sessions.len() >= self.settings.max_sessions_per_target {
            let Some((idx, session)) = pool
                .sessions
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.active_leases())
                .map(|(idx, s)| (idx, Arc::clone(s)))
            else {
                break;
            };
            if session.is_healthy().await {
                debug!(
                    remote = %target,
                    leases = session.active_leases(),
                    "session limit reached; packing channel onto least-loaded session"
                );
                return Ok(session.lease());
            }
            warn!(remote = %target, leases = session.active_leases(), "discarding unhealthy ssh session");
            pool.sessions.remove(idx);
            session.close().await;
        }

        let session = self.connect(target).await?;
        let lease = session.lease();
        pool.sessions.push(session);
        Ok(lease)
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: SessionLease) {
        debug!(remote = %lease.session.target, "releasing ssh channel");
        drop(lease);
    }

    /// Number of pooled sessions for `target`.
    pub async fn session_count(&self, target: &RemoteTarget) -> usize {
        let pool = self.pool_for(target);
        let pool = pool.lock().await;
        pool.sessions.len()
    }

    /// Close sessions with no leases that have been idle past the timeout or
    /// whose master has died. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for pool in self.all_pools() {
            let mut pool = pool.lock().await;
            let mut keep = Vec::with_capacity(pool.sessions.len());
            for session in pool.sessions.drain(..) {
                let unused = session.active_leases() == 0;
                if unused && (session.idle_for() >= self.settings.idle_timeout || !session.master_alive().await) {
                    debug!(remote = %session.target, "evicting idle ssh session");
                    session.close().await;
                    evicted += 1;
                } else {
                    keep.push(session);
                }
            }
            pool.sessions = keep;
        }
        evicted
    }

    /// Close every pooled session regardless of leases.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for pool in self.all_pools() {
            let mut pool = pool.lock().await;
            for session in pool.sessions.drain(..) {
                session.close().await;
                closed += 1;
            }
        }
        closed
    }

    async fn connect(&self, target: &RemoteTarget) -> Result<Arc<SshSession>> {
        let attempts = self.settings.connect_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.connect_once(target).await {
                Ok(session) => {
                    info!(remote = %target, attempt, "ssh session established");
                    return Ok(session);
                }
                Err(err) if attempt < attempts && err.is_retryable() => {
                    warn!(remote = %target, attempt, error = %err, "ssh connect failed; retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(remote = %target, attempt, error = %err, "ssh connect failed");
                    return Err(err);
                }
            }
        }
    }

    async fn connect_once(&self, target: &RemoteTarget) -> Result<Arc<SshSession>> {
        let control_path = self.next_control_path(target)?;
        if let Err(err) = std::fs::remove_file(&control_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %control_path.display(), error = %err, "failed to remove stale control socket");
            }
        }

        let settings = &self.settings;
        let mut cmd = settings.base_command();
        cmd.args(["-M", "-N"])
            .arg("-S")
            .arg(&control_path)
            .args(["-o", "ControlPersist=no", "-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", settings.connect_timeout.as_secs()))
            .args(["-o", "ServerAliveInterval=15", "-o", "ServerAliveCountMax=3"])
            .arg("-o")
            .arg(if settings.strict_host_key_checking {
                "StrictHostKeyChecking=yes"
            } else {
                "StrictHostKeyChecking=accept-new"
            });
        if let Some(key) = &target.key_reference {
            cmd.arg("-i").arg(key).args(["-o", "IdentitiesOnly=yes"]);
        }
        cmd.arg("-p")
            .arg(target.port.to_string())
            .arg("-l")
            .arg(&target.user)
            .arg(&target.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(remote = %target, control_path = %control_path.display(), "starting ssh master");
        let mut child = cmd.spawn().map_err(|source| SshError::Spawn {
            program: settings.program().to_string(),
            source,
        })?;
        let mut stderr_task = child.stderr.take().map(|s| spawn_stderr_reader(s, target.clone()));

        let deadline = Instant::now() + settings.connect_timeout + CONNECT_SLACK;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = match stderr_task.take() {
                        Some(task) => timeout(Duration::from_secs(1), task)
                            .await
                            .ok()
                            .and_then(std::result::Result::ok)
                            .unwrap_or_default(),
                        None => Vec::new(),
                    };
                    return Err(connect_failure(target, status, &stderr.join("\n")));
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(SshError::Connect {
                        target: target.to_string(),
                        cause: ConnectionCause::Other,
                        message: format!("failed to poll ssh master: {err}"),
                    });
                }
            }

            if check_control(settings, &control_path, target).await {
                break;
            }

            if Instant::now() >= deadline {
                if let Err(err) = child.kill().await {
                    debug!(remote = %target, error = %err, "failed to kill stalled ssh master");
                }
                return Err(SshError::Connect {
                    target: target.to_string(),
                    cause: ConnectionCause::Timeout,
                    message: format!(
                        "no session after {}s",
                        (settings.connect_timeout + CONNECT_SLACK).as_secs()
                    ),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        Ok(Arc::new(SshSession {
            target: target.clone(),
            control_path,
            settings: Arc::clone(&self.settings),
            master: Mutex::new(Some(child)),
            leases: AtomicUsize::new(0),
            last_used: StdMutex::new(Instant::now()),
        }))
    }

    /// `<control_dir>/<hash>-<n>.sock`. Hashing keeps the path short enough
    /// for a unix socket.
    fn next_control_path(&self, target: &RemoteTarget) -> Result<PathBuf> {
        let dir = &self.settings.control_dir;
        prepare_control_dir(dir).map_err(|source| SshError::ControlDir {
            path: dir.display().to_string(),
            source,
        })?;
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(dir.join(format!("{}-{n}.sock", target_digest(target))))
    }
}

fn prepare_control_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

/// Short stable digest of the connection triple.
fn target_digest(target: &RemoteTarget) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.user.as_bytes());
    hasher.update(b"@");
    hasher.update(target.host.as_bytes());
    hasher.update(b":");
    hasher.update(target.port.to_be_bytes());
    if let Some(key) = &target.key_reference {
        hasher.update(key.as_os_str().as_encoded_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

async fn check_control(settings: &SshSettings, control_path: &Path, target: &RemoteTarget) -> bool {
    let mut cmd = settings.base_command();
    cmd.arg("-S")
        .arg(control_path)
        .args(["-O", "check"])
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-l")
        .arg(&target.user)
        .arg(&target.host)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    matches!(timeout(CONTROL_TIMEOUT, cmd.status()).await, Ok(Ok(status)) if status.success())
}

/// Log master stderr at debug level and keep the last lines for errors.
fn spawn_stderr_reader(stderr: ChildStderr, target: RemoteTarget) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut kept = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(remote = %target, line = %line, "ssh master");
            if kept.len() == STDERR_KEEP_LINES {
                kept.remove(0);
            }
            kept.push(line);
        }
        kept
    })
}

fn connect_failure(target: &RemoteTarget, status: ExitStatus, stderr: &str) -> SshError {
    let message = if stderr.trim().is_empty() {
        format!("ssh exited with {status}")
    } else {
        stderr.trim().to_string()
    };
    SshError::Connect {
        target: target.to_string(),
        cause: classify_stderr(stderr),
        message,
    }
}

/// Map OpenSSH diagnostics onto connection causes.
pub fn classify_stderr(stderr: &str) -> ConnectionCause {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures")
        || lower.contains("host key verification failed")
    {
        ConnectionCause::Authentication
    } else if lower.contains("timed out") {
        ConnectionCause::Timeout
    } else if lower.contains("could not resolve hostname")
        || lower.contains("name or service not known")
        || lower.contains("no route to host")
        || lower.contains("connection refused")
        || lower.contains("network is unreachable")
    {
        ConnectionCause::Unreachable
    } else {
        ConnectionCause::Other
    }
}

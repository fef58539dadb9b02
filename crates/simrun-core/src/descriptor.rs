//! Run descriptors: what to execute, where, and who to tell when it ends.
//!
//! A descriptor is immutable once accepted by the registry. Structural
//! validation happens here; filesystem checks that only make sense for the
//! local host live in [`RunDescriptor::validate_local_paths`].

use crate::types::RunState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("executable must not be empty")]
    EmptyExecutable,
    #[error("argument list must not be empty")]
    EmptyArguments,
    #[error("working directory must be an absolute path: {0}")]
    RelativeWorkingDirectory(String),
    #[error("working directory does not exist or is not a directory: {0}")]
    MissingWorkingDirectory(String),
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("remote target is missing a host")]
    MissingHost,
    #[error("remote target is missing a user")]
    MissingUser,
    #[error("remote target port must be non-zero")]
    InvalidPort,
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("invalid notification topic: {0}")]
    InvalidTopic(String),
    #[error("invalid environment variable name: {0}")]
    InvalidEnvName(String),
}

/// Program plus its arguments, passed verbatim to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ExecutableSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Shell-like rendering for logs and listings. Not used for execution.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Connection triple for a remote host. Runs that share a triple share an
/// SSH session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    /// Private key path. `None` defers to the agent and the client's defaults.
    #[serde(default)]
    pub key_reference: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_reference: None,
            port: DEFAULT_SSH_PORT,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key_reference = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    #[default]
    Local,
    Remote(RemoteTarget),
}

impl Target {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Local => "local".to_string(),
            Self::Remote(remote) => remote.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email(String),
    Topic(String),
}

impl NotificationChannel {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Topic(_) => "topic",
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            Self::Email(address) => address,
            Self::Topic(topic) => topic,
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.destination())
    }
}

/// Which terminal outcomes produce a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    OnSuccess,
    OnFailure,
    #[default]
    Always,
}

impl TriggerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
            Self::Always => "always",
        }
    }

    /// Whether a run that ended in `state` should notify. Non-terminal
    /// states never match.
    pub fn matches(&self, state: RunState) -> bool {
        match self {
            Self::Always => state.is_terminal(),
            Self::OnSuccess => state == RunState::Succeeded,
            Self::OnFailure => matches!(
                state,
                RunState::Failed | RunState::Errored | RunState::Cancelled
            ),
        }
    }
}

impl std::str::FromStr for TriggerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_success" | "on-success" => Ok(Self::OnSuccess),
            "on_failure" | "on-failure" => Ok(Self::OnFailure),
            "always" => Ok(Self::Always),
            other => Err(format!(
                "trigger must be 'on_success', 'on_failure', or 'always', got '{other}'"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreference {
    #[serde(default)]
    pub channels: Vec<NotificationChannel>,
    #[serde(default)]
    pub trigger: TriggerPolicy,
}

impl NotificationPreference {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub executable: ExecutableSpec,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub target: Target,
    /// Wall-clock limit measured from the moment the run starts executing.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub notification: NotificationPreference,
    /// Extra environment for the launched process; inherited env is kept.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Substrings flagged in output. Diagnostic only, never changes the outcome.
    #[serde(default)]
    pub error_markers: Vec<String>,
}

impl RunDescriptor {
    pub fn new(executable: ExecutableSpec, working_directory: impl Into<PathBuf>, target: Target) -> Self {
        Self {
            executable,
            working_directory: working_directory.into(),
            target,
            timeout_ms: None,
            notification: NotificationPreference::default(),
            env: BTreeMap::new(),
            label: None,
            error_markers: Vec::new(),
        }
    }

    pub fn local(executable: ExecutableSpec, working_directory: impl Into<PathBuf>) -> Self {
        Self::new(executable, working_directory, Target::Local)
    }

    pub fn remote(
        executable: ExecutableSpec,
        working_directory: impl Into<PathBuf>,
        remote: RemoteTarget,
    ) -> Self {
        Self::new(executable, working_directory, Target::Remote(remote))
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn with_notification(mut self, notification: NotificationPreference) -> Self {
        self.notification = notification;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_error_markers(mut self, markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.error_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Label if given, otherwise the program's file name.
    pub fn display_label(&self) -> String {
        if let Some(label) = self.label.as_deref().filter(|l| !l.trim().is_empty()) {
            return label.to_string();
        }
        std::path::Path::new(&self.executable.program)
            .file_name()
            .map_or_else(
                || self.executable.program.clone(),
                |name| name.to_string_lossy().into_owned(),
            )
    }

    /// Structural checks that hold regardless of where the run executes.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.executable.program.trim().is_empty() {
            return Err(ValidationError::EmptyExecutable);
        }
        if self.executable.args.is_empty() {
            return Err(ValidationError::EmptyArguments);
        }
        if !self.working_directory.is_absolute() {
            return Err(ValidationError::RelativeWorkingDirectory(
                self.working_directory.display().to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(ValidationError::ZeroTimeout);
        }
        if let Target::Remote(remote) = &self.target {
            if remote.host.trim().is_empty() {
                return Err(ValidationError::MissingHost);
            }
            if remote.user.trim().is_empty() {
                return Err(ValidationError::MissingUser);
            }
            if remote.port == 0 {
                return Err(ValidationError::InvalidPort);
            }
        }
        for channel in &self.notification.channels {
            validate_channel(channel)?;
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ValidationError::InvalidEnvName(key.clone()));
            }
        }
        Ok(())
    }

    /// For local targets the working directory must exist up front. Remote
    /// directories can only be checked once connected.
    pub fn validate_local_paths(&self) -> Result<(), ValidationError> {
        if matches!(self.target, Target::Local) && !self.working_directory.is_dir() {
            return Err(ValidationError::MissingWorkingDirectory(
                self.working_directory.display().to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_channel(channel: &NotificationChannel) -> Result<(), ValidationError> {
    match channel {
        NotificationChannel::Email(address) => {
            let valid = address
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
                && !address.chars().any(char::is_whitespace);
            if !valid {
                return Err(ValidationError::InvalidEmail(address.clone()));
            }
        }
        NotificationChannel::Topic(topic) => {
            let valid = !topic.is_empty()
                && topic
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(ValidationError::InvalidTopic(topic.clone()));
            }
        }
    }
    Ok(())
}

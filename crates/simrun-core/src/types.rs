//! Run identity, lifecycle states, and the run record.
//!
//! `RunRecord` owns the state machine: every transition goes through
//! [`RunRecord::transition`] or [`RunRecord::finish`], which reject
//! backwards moves and any change after a terminal state is reached.

use crate::descriptor::RunDescriptor;
use crate::tail::OutputTail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque run identifier. Uses `UUIDv7` so ids sort by submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Connecting,
    Running,
    Succeeded,
    Failed,
    Errored,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Connecting => "CONNECTING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Errored => "ERRORED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Cancelled
        )
    }

    /// Position in the lifecycle. Terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Connecting => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Cancelled => 3,
        }
    }

    /// Legal edges of the lifecycle graph. Local runs skip `Connecting`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Connecting | Self::Running | Self::Errored | Self::Cancelled
            ),
            Self::Connecting => matches!(next, Self::Running | Self::Errored | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Errored | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "CONNECTING" => Ok(Self::Connecting),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "ERRORED" => Ok(Self::Errored),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionCause {
    Authentication,
    Unreachable,
    Timeout,
    Other,
}

impl ConnectionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ConnectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured cause attached to `Failed` and `Errored` runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The program ran and exited non-zero.
    ExitCode { code: i32 },
    /// The run exceeded its wall-clock limit and was terminated.
    Timeout { limit_ms: u64 },
    /// The remote session could not be established.
    Connection {
        cause: ConnectionCause,
        message: String,
    },
    /// The process could not be started (missing program, permissions).
    Launch { message: String },
    /// The transport broke while the run was executing.
    Transport { message: String },
}

impl FailureReason {
    pub fn category(&self) -> &'static str {
        match self {
            Self::ExitCode { .. } => "exit_code",
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::Launch { .. } => "launch",
            Self::Transport { .. } => "transport",
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn describe(&self) -> String {
        match self {
            Self::ExitCode { code } => format!("process exited with code {code}"),
            Self::Timeout { limit_ms } => {
                format!("timed out after {:.1}s", *limit_ms as f64 / 1000.0)
            }
            Self::Connection { cause, message } => {
                format!("connection failed ({cause}): {message}")
            }
            Self::Launch { message } => format!("process could not be started: {message}"),
            Self::Transport { message } => format!("transport failure: {message}"),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Stderr,
            text: text.into(),
        }
    }
}

/// How a run ended. Carries exactly the data each terminal state needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Non-zero exit or timeout. `exit_code` is the status of the process
    /// that was observed, `128 + signal` when it died from a signal.
    Failed {
        exit_code: i32,
        reason: FailureReason,
    },
    Errored {
        reason: FailureReason,
    },
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> RunState {
        match self {
            Self::Succeeded => RunState::Succeeded,
            Self::Failed { .. } => RunState::Failed,
            Self::Errored { .. } => RunState::Errored,
            Self::Cancelled => RunState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid state transition: {from} -> {to}")]
    Invalid { from: RunState, to: RunState },
    #[error("run already reached terminal state {0}")]
    AlreadyTerminal(RunState),
    #[error("{0} is not a terminal state")]
    NotTerminal(RunState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Bounds applied to the per-run buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    pub tail_lines: usize,
    pub marker_hits: usize,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            tail_lines: 200,
            marker_hits: 50,
        }
    }
}

/// Registry-owned view of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub descriptor: RunDescriptor,
    pub state: RunState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<FailureReason>,
    pub output_tail: OutputTail,
    /// Output lines matching one of the descriptor's error markers.
    pub marker_hits: OutputTail,
    /// Non-fatal problems, e.g. notification delivery failures.
    pub warnings: Vec<String>,
    pub history: Vec<StateTransition>,
}

impl RunRecord {
    pub fn new(id: RunId, descriptor: RunDescriptor, limits: RecordLimits, now: DateTime<Utc>) -> Self {
        Self {
            id,
            descriptor,
            state: RunState::Pending,
            submitted_at: now,
            started_at: None,
            ended_at: None,
            exit_code: None,
            failure_reason: None,
            output_tail: OutputTail::new(limits.tail_lines),
            marker_hits: OutputTail::new(limits.marker_hits),
            warnings: Vec::new(),
            history: vec![StateTransition {
                state: RunState::Pending,
                at: now,
            }],
        }
    }

    /// Move to a non-terminal state. Terminal states go through [`Self::finish`].
    pub fn transition(&mut self, next: RunState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if next.is_terminal() {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: next,
            });
        }
        self.check_edge(next)?;
        if next == RunState::Running {
            self.started_at = Some(now);
        }
        self.enter(next, now);
        Ok(())
    }

    /// Commit the terminal state. Succeeds at most once per record.
    pub fn finish(&mut self, outcome: Outcome, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = outcome.state();
        self.check_edge(next)?;
        match outcome {
            Outcome::Succeeded => {
                self.exit_code = Some(0);
            }
            Outcome::Failed { exit_code, reason } => {
                self.exit_code = Some(exit_code);
                self.failure_reason = Some(reason);
            }
            Outcome::Errored { reason } => {
                self.failure_reason = Some(reason);
            }
            Outcome::Cancelled => {}
        }
        self.ended_at = Some(now);
        self.enter(next, now);
        Ok(())
    }

    fn check_edge(&self, next: RunState) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.state));
        }
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: next,
            });
        }
        Ok(())
    }

    fn enter(&mut self, next: RunState, now: DateTime<Utc>) {
        self.state = next;
        self.history.push(StateTransition { state: next, at: now });
    }

    /// Append a line to the tail and return whether it matched an error marker.
    pub fn push_output(&mut self, line: OutputLine) -> bool {
        let hit = self
            .descriptor
            .error_markers
            .iter()
            .any(|marker| !marker.is_empty() && line.text.contains(marker.as_str()));
        if hit {
            self.marker_hits.push(line.clone());
        }
        self.output_tail.push(line);
        hit
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Elapsed run time: `started_at` to `ended_at` (or `now` while running).
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or(now) - started)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            label: self.descriptor.display_label(),
            target: self.descriptor.target.summary(),
            state: self.state,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            exit_code: self.exit_code,
            cause: self.failure_reason.as_ref().map(FailureReason::describe),
        }
    }
}

/// Row returned by registry listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub label: String,
    pub target: String,
    pub state: RunState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub cause: Option<String>,
}

/// Which runs a listing includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListScope {
    Active,
    Terminal,
    #[default]
    All,
}

impl ListScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Terminal => "terminal",
            Self::All => "all",
        }
    }

    pub fn includes(&self, state: RunState) -> bool {
        match self {
            Self::Active => !state.is_terminal(),
            Self::Terminal => state.is_terminal(),
            Self::All => true,
        }
    }
}

impl std::str::FromStr for ListScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "terminal" => Ok(Self::Terminal),
            "all" => Ok(Self::All),
            other => Err(format!(
                "scope must be 'active', 'terminal', or 'all', got '{other}'"
            )),
        }
    }
}

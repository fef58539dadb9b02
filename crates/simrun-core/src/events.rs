//! Events delivered to run subscribers.
//!
//! Per run, state changes arrive in lifecycle order and output lines arrive
//! in the order they were read. The terminal `StateChanged` event is always
//! the last event of a subscription.

use crate::types::{FailureReason, OutputLine, RunId, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StateChanged {
        run_id: RunId,
        state: RunState,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
    },
    Output {
        run_id: RunId,
        line: OutputLine,
    },
}

impl RunEvent {
    /// Name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state",
            Self::Output { .. } => "output",
        }
    }

    pub fn state(&self) -> Option<RunState> {
        match self {
            Self::StateChanged { state, .. } => Some(*state),
            Self::Output { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(|s| s.is_terminal())
    }
}

//! Run and target lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{DeployError, DeployResult};
use crate::executor::StepResult;

/// Lifecycle of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::PartiallyFailed | RunState::Aborted
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Running)
                | (RunState::Pending, RunState::Aborted)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::PartiallyFailed)
                | (RunState::Running, RunState::Aborted)
        )
    }

    /// Process exit code for a terminal state.
    pub fn exit_code(self) -> u8 {
        match self {
            RunState::Succeeded => 0,
            RunState::PartiallyFailed => 1,
            RunState::Pending | RunState::Running | RunState::Aborted => 2,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::PartiallyFailed => write!(f, "partially_failed"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Enforces legal [`RunState`] transitions and records when each happened.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    history: Vec<(RunState, DateTime<Utc>)>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Pending,
            history: vec![(RunState::Pending, Utc::now())],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[(RunState, DateTime<Utc>)] {
        &self.history
    }

    pub fn transition(&mut self, next: RunState) -> DeployResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal status of one target within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Every planned step succeeded.
    Succeeded,
    /// At least one step succeeded, then one failed.
    PartiallyFailed,
    /// The first step run on the target failed.
    Failed,
    /// The target was healthy but the run stopped before its steps completed.
    Aborted,
    /// No step was ever started on the target.
    Skipped,
}

impl TargetStatus {
    /// Derive a status from the steps a target actually ran.
    pub fn from_results(results: &[StepResult], planned: usize) -> Self {
        let failure = results.iter().position(|r| !r.succeeded());
        match failure {
            None if results.is_empty() => TargetStatus::Skipped,
            None if results.len() >= planned => TargetStatus::Succeeded,
            None => TargetStatus::Aborted,
            Some(idx) if results[idx].cancelled() => TargetStatus::Aborted,
            Some(0) => TargetStatus::Failed,
            Some(_) => TargetStatus::PartiallyFailed,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TargetStatus::Failed | TargetStatus::PartiallyFailed)
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Succeeded => write!(f, "succeeded"),
            TargetStatus::PartiallyFailed => write!(f, "partially_failed"),
            TargetStatus::Failed => write!(f, "failed"),
            TargetStatus::Aborted => write!(f, "aborted"),
            TargetStatus::Skipped => write!(f, "skipped"),
        }
    }
}

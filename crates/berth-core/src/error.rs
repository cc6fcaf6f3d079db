//! Error types for remote execution and orchestration.

use berth_stage::{ConfigError, ResolutionError};

use crate::state::RunState;

/// A session could not be opened, or was lost while in use.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {host}: {reason}")]
    Failed { host: String, reason: String },

    #[error("connecting to {host} timed out after {limit_ms}ms")]
    Timeout { host: String, limit_ms: u64 },

    #[error("connection to {host} lost: {reason}")]
    Lost { host: String, reason: String },
}

impl ConnectionError {
    pub fn host(&self) -> &str {
        match self {
            ConnectionError::Failed { host, .. }
            | ConnectionError::Timeout { host, .. }
            | ConnectionError::Lost { host, .. } => host,
        }
    }
}

/// The remote command ran (or was started) but did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("step '{step}' on {host} exited with status {exit_code}")]
    Failed {
        step: String,
        host: String,
        exit_code: i32,
    },

    #[error("step '{step}' on {host} was terminated by a signal")]
    Killed { step: String, host: String },

    #[error("step '{step}' on {host} timed out after {limit_ms}ms")]
    Timeout {
        step: String,
        host: String,
        limit_ms: u64,
    },

    #[error("step '{step}' on {host} was cancelled")]
    Cancelled { step: String, host: String },
}

impl CommandError {
    pub fn step(&self) -> &str {
        match self {
            CommandError::Failed { step, .. }
            | CommandError::Killed { step, .. }
            | CommandError::Timeout { step, .. }
            | CommandError::Cancelled { step, .. } => step,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}

/// Why a single step on a single target failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl ExecError {
    /// Short classification used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Connection(ConnectionError::Timeout { .. }) => "connection_timeout",
            ExecError::Connection(_) => "connection",
            ExecError::Command(CommandError::Timeout { .. }) => "command_timeout",
            ExecError::Command(CommandError::Cancelled { .. }) => "cancelled",
            ExecError::Command(_) => "command",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Command(CommandError::Cancelled { .. }))
    }
}

/// Errors that stop a deployment from producing a report.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("invalid run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("worker for {host} failed: {reason}")]
    Worker { host: String, reason: String },
}

/// A rollout strategy name that is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy '{0}' (expected 'all-at-once' or 'rolling')")]
pub struct ParseStrategyError(pub String);

/// Result type for orchestration operations.
pub type DeployResult<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_and_command_errors_stay_distinct() {
        let conn: ExecError = ConnectionError::Timeout {
            host: "web1".to_string(),
            limit_ms: 100,
        }
        .into();
        let cmd: ExecError = CommandError::Timeout {
            step: "check".to_string(),
            host: "web1".to_string(),
            limit_ms: 100,
        }
        .into();

        assert_eq!(conn.kind(), "connection_timeout");
        assert_eq!(cmd.kind(), "command_timeout");
        assert!(matches!(cmd, ExecError::Command(ref c) if c.timed_out()));
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::Failed {
            step: "restart".to_string(),
            host: "web1".to_string(),
            exit_code: 3,
        };
        assert_eq!(err.to_string(), "step 'restart' on web1 exited with status 3");
        assert_eq!(err.step(), "restart");
    }
}

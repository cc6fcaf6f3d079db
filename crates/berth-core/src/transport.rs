//! Transport seam between the executor and a remote shell.

use async_trait::async_trait;
use berth_stage::ExecutionTarget;

use crate::error::ConnectionError;

/// What a remote command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the command was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }
}

/// Opens sessions to execution targets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &ExecutionTarget) -> Result<Box<dyn Session>, ConnectionError>;
}

/// An open session to one host. Owned by exactly one worker.
#[async_trait]
pub trait Session: Send {
    /// Run a shell command. A non-zero exit is an `Ok` output; only
    /// transport failures are errors.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ConnectionError>;

    /// Release the session. Must be safe to call more than once.
    async fn close(&mut self);
}

//! Remote executor: runs one step on one target inside a scoped session.

use std::sync::Arc;
use std::time::Duration;

use berth_stage::{ExecutionTarget, RuntimeConfig, Stage, Step};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{CommandError, ConnectionError, ExecError};
use crate::obs;
use crate::transport::{CommandOutput, Session, Transport};

/// Upper bound on how long closing a session may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Values substituted into command templates for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub stage: String,
    pub deploy_to: Option<String>,
    pub branch: Option<String>,
    /// Shell every command is wrapped in, when the stage sets one.
    pub shell: Option<String>,
    /// Release identifier, fixed for the whole run.
    pub release: String,
}

impl StepContext {
    pub fn new(stage: &Stage, release: impl Into<String>) -> Self {
        Self {
            stage: stage.name().to_string(),
            deploy_to: stage.options().deploy_to().map(str::to_string),
            branch: stage.options().branch().map(str::to_string),
            shell: stage.options().default_shell().map(str::to_string),
            release: release.into(),
        }
    }

    /// Context with a release stamp taken from `now`.
    pub fn at(stage: &Stage, now: DateTime<Utc>) -> Self {
        Self::new(stage, release_stamp(now))
    }
}

/// `YYYYMMDDHHMMSS`, the conventional release directory name.
pub fn release_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Expand a step's command template for a target.
///
/// Placeholders: `{deploy_to}`, `{branch}`, `{stage}`, `{host}`, `{user}`,
/// `{release}`. Unknown placeholders are left untouched. A step using a value
/// the stage does not set never gets here: `Resolver::resolve_plan` rejects it.
/// With `within_deploy_to` the command runs from that directory, and with a
/// `default_shell` the result is passed to `<shell> -c`.
pub fn render_command(step: &Step, target: &ExecutionTarget, ctx: &StepContext) -> String {
    let deploy_to = ctx.deploy_to.as_deref().unwrap_or("");
    let branch = ctx.branch.as_deref().unwrap_or("");
    let user = target.endpoint.user.as_deref().unwrap_or("");
    let command = step
        .command
        .replace("{deploy_to}", deploy_to)
        .replace("{branch}", branch)
        .replace("{stage}", &ctx.stage)
        .replace("{host}", target.host())
        .replace("{user}", user)
        .replace("{release}", &ctx.release);

    let command = match (&ctx.deploy_to, step.within_deploy_to) {
        (Some(dir), true) => format!("cd {} && {command}", shell_quote(dir)),
        _ => command,
    };
    match &ctx.shell {
        Some(shell) => format!("{shell} -c {}", shell_quote(&command)),
        None => command,
    }
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Outcome of one step on one target.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub host: String,
    pub step: String,
    /// The command as sent, after template expansion.
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "crate::report::serialize_millis")]
    pub duration: Duration,
    #[serde(serialize_with = "crate::report::serialize_error")]
    pub error: Option<ExecError>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn timed_out(&self) -> bool {
        matches!(&self.error, Some(ExecError::Command(c)) if c.timed_out())
    }

    pub fn cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(ExecError::is_cancelled)
    }
}

enum ExecOutcome {
    Finished(Result<CommandOutput, ConnectionError>),
    TimedOut,
    Cancelled,
}

/// Runs steps through a [`Transport`].
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    command_timeout: Duration,
    cancel_grace: Duration,
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>, config: &RuntimeConfig) -> Self {
        Self {
            transport,
            command_timeout: config.command_timeout,
            cancel_grace: config.cancel_grace,
        }
    }

    /// The step's own timeout, or the runtime default.
    pub fn timeout_for(&self, step: &Step) -> Duration {
        step.timeout.unwrap_or(self.command_timeout)
    }

    /// Run `step` on `target` in a fresh session.
    ///
    /// The session is closed on every path that opened one. Connect is bounded
    /// by the endpoint's connect timeout, the command by `timeout`. After
    /// cancellation an in-flight command gets the grace period (capped by
    /// what is left of `timeout`) before it is dropped.
    pub async fn run_step(
        &self,
        target: &ExecutionTarget,
        step: &Step,
        ctx: &StepContext,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> StepResult {
        let command = render_command(step, target, ctx);
        let mut result = StepResult {
            host: target.host().to_string(),
            step: step.name.clone(),
            command,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            error: None,
        };
        let started = Instant::now();
        obs::emit_step_started(&result.host, &result.step, &result.command);

        if cancel.is_cancelled() {
            result.error = Some(self.cancelled(step, target));
            return self.finish(result, started);
        }

        let connect_limit = target.endpoint.connect_timeout;
        let connected = tokio::select! {
            res = tokio::time::timeout(connect_limit, self.transport.connect(target)) => res,
            _ = cancel.cancelled() => {
                result.error = Some(self.cancelled(step, target));
                return self.finish(result, started);
            }
        };
        let mut session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                result.error = Some(e.into());
                return self.finish(result, started);
            }
            Err(_) => {
                result.error = Some(
                    ConnectionError::Timeout {
                        host: target.host().to_string(),
                        limit_ms: millis(connect_limit),
                    }
                    .into(),
                );
                return self.finish(result, started);
            }
        };

        let outcome = self
            .exec_bounded(session.as_mut(), &result.command, timeout, cancel)
            .await;
        if tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
            warn!(host = %result.host, "closing session timed out");
        }

        match outcome {
            ExecOutcome::Finished(Ok(output)) => {
                result.exit_code = output.exit_code;
                result.stdout = output.stdout;
                result.stderr = output.stderr;
                result.error = match output.exit_code {
                    Some(code) if step.accepts(code) => None,
                    Some(code) => Some(
                        CommandError::Failed {
                            step: step.name.clone(),
                            host: result.host.clone(),
                            exit_code: code,
                        }
                        .into(),
                    ),
                    None => Some(
                        CommandError::Killed {
                            step: step.name.clone(),
                            host: result.host.clone(),
                        }
                        .into(),
                    ),
                };
            }
            ExecOutcome::Finished(Err(e)) => result.error = Some(e.into()),
            ExecOutcome::TimedOut => {
                result.error = Some(
                    CommandError::Timeout {
                        step: step.name.clone(),
                        host: result.host.clone(),
                        limit_ms: millis(timeout),
                    }
                    .into(),
                )
            }
            ExecOutcome::Cancelled => result.error = Some(self.cancelled(step, target)),
        }
        self.finish(result, started)
    }

    async fn exec_bounded(
        &self,
        session: &mut dyn Session,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> ExecOutcome {
        let deadline = Instant::now() + timeout;
        let exec = session.exec(command);
        tokio::pin!(exec);

        tokio::select! {
            res = tokio::time::timeout_at(deadline, &mut exec) => {
                return match res {
                    Ok(out) => ExecOutcome::Finished(out),
                    Err(_) => ExecOutcome::TimedOut,
                };
            }
            _ = cancel.cancelled() => {}
        }

        let grace = self
            .cancel_grace
            .min(deadline.saturating_duration_since(Instant::now()));
        debug!(grace_ms = millis(grace), "cancelled, waiting for in-flight command");
        match tokio::time::timeout(grace, &mut exec).await {
            Ok(out) => ExecOutcome::Finished(out),
            Err(_) => ExecOutcome::Cancelled,
        }
    }

    fn cancelled(&self, step: &Step, target: &ExecutionTarget) -> ExecError {
        CommandError::Cancelled {
            step: step.name.clone(),
            host: target.host().to_string(),
        }
        .into()
    }

    fn finish(&self, mut result: StepResult, started: Instant) -> StepResult {
        result.duration = started.elapsed();
        obs::emit_step_finished(
            &result.host,
            &result.step,
            millis(result.duration),
            result.exit_code,
            result.error.as_ref().map(|e| e as &dyn std::fmt::Display),
        );
        result
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

//! Orchestrator: sequences steps across targets according to a rollout
//! strategy and assembles the final report.
//!
//! Every worker owns its session and its step results and hands them back
//! through its `JoinHandle`; the report is built only after all workers have
//! joined.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use berth_stage::{
    ExecutionTarget, ResolvedPlan, Resolver, RuntimeConfig, Stage, Step, TargetPlan,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{DeployError, DeployResult, ParseStrategyError};
use crate::executor::{millis, render_command, release_stamp, Executor, StepContext, StepResult};
use crate::obs;
use crate::report::{DeployPlan, DeployReport, PlannedCommand, PlannedStep, TargetReport};
use crate::ssh::SshTransport;
use crate::state::{RunState, RunStateMachine, TargetStatus};
use crate::transport::Transport;

/// How steps are rolled out across targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Each step runs on every target before the next step starts. The first
    /// failure aborts the run.
    AllAtOnce,
    /// Each target runs the whole sequence before the next target starts.
    /// Failures are isolated to their target.
    Rolling,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::AllAtOnce => "all-at-once",
            Strategy::Rolling => "rolling",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all-at-once" | "all_at_once" => Ok(Strategy::AllAtOnce),
            "rolling" => Ok(Strategy::Rolling),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}

/// Results of one target after its worker(s) joined.
struct TargetRun {
    plan: TargetPlan,
    results: Vec<StepResult>,
}

/// Runs deployments for stages.
#[derive(Clone)]
pub struct Orchestrator {
    executor: Executor,
    resolver: Resolver,
    max_parallel: usize,
    batch_size: usize,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn Transport>, config: &RuntimeConfig) -> Self {
        Self {
            executor: Executor::new(transport, config),
            resolver: Resolver::new(config),
            max_parallel: config.max_parallel.max(1),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Orchestrator driving the system ssh client.
    pub fn with_ssh(config: &RuntimeConfig) -> Self {
        Self::new(Arc::new(SshTransport::new(config)), config)
    }

    /// Resolve targets and expand every command without connecting anywhere.
    pub fn plan(&self, stage: &Stage, steps: &[Step], strategy: Strategy) -> DeployResult<DeployPlan> {
        let resolved = self.resolver.resolve_plan(stage, steps)?;
        let ctx = StepContext::at(stage, Utc::now());

        let steps = resolved
            .steps
            .iter()
            .map(|rs| PlannedStep {
                step: rs.step.name.clone(),
                timeout_ms: millis(self.executor.timeout_for(&rs.step)),
                success_codes: rs.step.success_codes.clone(),
                commands: rs
                    .targets
                    .iter()
                    .map(|target| PlannedCommand {
                        host: target.host().to_string(),
                        endpoint: target.to_string(),
                        auth: target.endpoint.auth.kind(),
                        roles: target.roles.clone(),
                        command: render_command(&rs.step, target, &ctx),
                    })
                    .collect(),
            })
            .collect();

        Ok(DeployPlan {
            stage: stage.name().to_string(),
            strategy,
            stage_digest: stage.digest().to_string(),
            release: ctx.release,
            steps,
        })
    }

    /// Deploy without external cancellation.
    pub async fn deploy(&self, stage: &Stage, steps: &[Step], strategy: Strategy) -> DeployResult<DeployReport> {
        self.deploy_with_cancel(stage, steps, strategy, CancelToken::never())
            .await
    }

    /// Deploy `steps` to `stage`.
    ///
    /// Resolution happens before any connection is made, so a resolution
    /// error leaves every host untouched. Once cancelled, no new step is
    /// issued and the run ends `Aborted`.
    pub async fn deploy_with_cancel(
        &self,
        stage: &Stage,
        steps: &[Step],
        strategy: Strategy,
        cancel: CancelToken,
    ) -> DeployResult<DeployReport> {
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string(), stage.name());
        self.run(run_id, stage, steps, strategy, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        run_id: Uuid,
        stage: &Stage,
        steps: &[Step],
        strategy: Strategy,
        cancel: CancelToken,
    ) -> DeployResult<DeployReport> {
        let mut machine = RunStateMachine::new();
        let started_at = Utc::now();
        let started = Instant::now();
        let ctx = StepContext::new(stage, release_stamp(started_at));

        let plan = self.resolver.resolve_plan(stage, steps)?;
        let targets = plan.per_target();

        obs::emit_deploy_started(
            &run_id.to_string(),
            stage.name(),
            strategy.as_str(),
            targets.len(),
            plan.steps.len(),
        );
        machine.transition(RunState::Running)?;

        let runs = match strategy {
            Strategy::AllAtOnce => self.run_all_at_once(&plan, targets, &ctx, &cancel).await?,
            Strategy::Rolling => self.run_rolling(&plan, targets, &ctx, &cancel).await?,
        };

        let cancelled = cancel.is_cancelled();
        let target_reports: Vec<TargetReport> = runs
            .into_iter()
            .map(|run| {
                let status = TargetStatus::from_results(&run.results, run.plan.steps.len());
                let first_error = run.results.iter().find_map(|r| r.error.clone());
                TargetReport {
                    host: run.plan.target.host().to_string(),
                    endpoint: run.plan.target.to_string(),
                    roles: run.plan.target.roles.clone(),
                    status,
                    steps: run.results,
                    first_error,
                }
            })
            .collect();

        let any_failed = target_reports.iter().any(|t| t.status.is_failure());
        let final_state = match strategy {
            _ if cancelled => RunState::Aborted,
            Strategy::AllAtOnce if any_failed => RunState::Aborted,
            Strategy::Rolling if any_failed => RunState::PartiallyFailed,
            _ => RunState::Succeeded,
        };
        machine.transition(final_state)?;

        let report = DeployReport {
            run_id,
            stage: stage.name().to_string(),
            strategy,
            state: machine.state(),
            stage_digest: stage.digest().to_string(),
            release: ctx.release,
            started_at,
            finished_at: Utc::now(),
            duration: started.elapsed(),
            targets: target_reports,
        };
        obs::emit_deploy_finished(
            &run_id.to_string(),
            &report.state.to_string(),
            millis(report.duration),
            report.failed_targets(),
        );
        Ok(report)
    }

    /// Barrier per step: every target of step i joins before step i+1 is
    /// issued, and any failure stops the run after the current step.
    async fn run_all_at_once(
        &self,
        plan: &ResolvedPlan,
        targets: Vec<TargetPlan>,
        ctx: &StepContext,
        cancel: &CancelToken,
    ) -> DeployResult<Vec<TargetRun>> {
        let index: HashMap<usize, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.target.position, i))
            .collect();
        let mut runs: Vec<TargetRun> = targets
            .into_iter()
            .map(|plan| TargetRun {
                plan,
                results: Vec::new(),
            })
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        for resolved in &plan.steps {
            if cancel.is_cancelled() {
                info!(step = %resolved.step.name, "run cancelled, not issuing step");
                break;
            }
            let timeout = self.executor.timeout_for(&resolved.step);
            let mut handles = Vec::with_capacity(resolved.targets.len());

            for target in &resolved.targets {
                let executor = self.executor.clone();
                let step = resolved.step.clone();
                let target: ExecutionTarget = target.clone();
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let semaphore = Arc::clone(&semaphore);
                let host = target.host().to_string();
                let position = target.position;

                let handle = tokio::spawn(
                    async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        if cancel.is_cancelled() {
                            return None;
                        }
                        Some(executor.run_step(&target, &step, &ctx, timeout, &cancel).await)
                    }
                    .in_current_span(),
                );
                handles.push((position, host, handle));
            }

            // Every sibling is joined before a worker failure is returned.
            let mut step_failed = false;
            let mut worker_error = None;
            for (position, host, handle) in handles {
                let joined = match handle.await {
                    Ok(joined) => joined,
                    Err(e) => {
                        worker_error.get_or_insert(DeployError::Worker {
                            host,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                let Some(result) = joined else { continue };
                if !result.succeeded() && !result.cancelled() {
                    step_failed = true;
                }
                if let Some(&i) = index.get(&position) {
                    runs[i].results.push(result);
                }
            }
            if let Some(err) = worker_error {
                return Err(err);
            }

            if step_failed {
                warn!(step = %resolved.step.name, "step failed, aborting remaining steps");
                break;
            }
        }
        Ok(runs)
    }

    /// Each target runs its steps in order and stops at its own first
    /// failure. Up to `batch_size` targets are in flight at once.
    async fn run_rolling(
        &self,
        plan: &ResolvedPlan,
        targets: Vec<TargetPlan>,
        ctx: &StepContext,
        cancel: &CancelToken,
    ) -> DeployResult<Vec<TargetRun>> {
        let joined: Vec<_> = stream::iter(targets)
            .map(|target_plan| {
                let executor = self.executor.clone();
                let steps: Vec<Step> = target_plan
                    .steps
                    .iter()
                    .map(|&i| plan.steps[i].step.clone())
                    .collect();
                let target = target_plan.target.clone();
                let ctx = ctx.clone();
                let cancel = cancel.clone();

                let handle = tokio::spawn(
                    async move {
                        let mut results = Vec::with_capacity(steps.len());
                        for step in &steps {
                            if cancel.is_cancelled() {
                                debug!(host = %target.host(), "run cancelled, stopping target");
                                break;
                            }
                            let timeout = executor.timeout_for(step);
                            let result =
                                executor.run_step(&target, step, &ctx, timeout, &cancel).await;
                            let ok = result.succeeded();
                            results.push(result);
                            if !ok {
                                break;
                            }
                        }
                        results
                    }
                    .in_current_span(),
                );
                async move { (target_plan, handle.await) }
            })
            .buffered(self.batch_size)
            .collect()
            .await;

        joined
            .into_iter()
            .map(|(plan, results)| {
                let results = results.map_err(|e| DeployError::Worker {
                    host: plan.target.host().to_string(),
                    reason: e.to_string(),
                })?;
                Ok(TargetRun { plan, results })
            })
            .collect()
    }
}

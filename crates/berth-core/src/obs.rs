//! Structured observability hooks for the deployment lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span carrying `run_id` and `stage`
//! - Emission functions for deploy start/finish and per-step start/finish
//!
//! Events are emitted at `info!` level (`warn!` for failures). Filtering and
//! JSON output are configured through [`crate::telemetry::init_tracing`].
//! Commands are logged after template expansion, which never substitutes
//! secret values.

use std::time::Duration;

use tracing::{info, warn};

use crate::executor::millis;

/// Run-scoped span, for instrumenting the run future across `.await` points.
pub fn run_span(run_id: &str, stage: &str) -> tracing::Span {
    tracing::info_span!("berth.deploy", run_id = %run_id, stage = %stage)
}

/// Emit event: deployment started.
pub fn emit_deploy_started(run_id: &str, stage: &str, strategy: &str, targets: usize, steps: usize) {
    info!(
        event = "deploy.started",
        run_id = %run_id,
        stage = %stage,
        strategy = %strategy,
        targets = targets,
        steps = steps,
    );
}

/// Emit event: a step was issued to a host.
pub fn emit_step_started(host: &str, step: &str, command: &str) {
    info!(event = "step.started", host = %host, step = %step, command = %command);
}

/// Emit event: a step finished on a host, successfully or not.
pub fn emit_step_finished(
    host: &str,
    step: &str,
    duration_ms: u64,
    exit_code: Option<i32>,
    error: Option<&dyn std::fmt::Display>,
) {
    match error {
        None => info!(
            event = "step.finished",
            host = %host,
            step = %step,
            duration_ms = duration_ms,
            exit_code = exit_code,
            success = true,
        ),
        Some(error) => warn!(
            event = "step.finished",
            host = %host,
            step = %step,
            duration_ms = duration_ms,
            exit_code = exit_code,
            success = false,
            error = %error,
        ),
    }
}

/// Emit event: cancellation was requested by the operator.
///
/// Called from outside the run span, so it carries the stage instead.
pub fn emit_cancel_requested(stage: &str, grace: Duration) {
    warn!(event = "deploy.cancel_requested", stage = %stage, grace_ms = millis(grace));
}

/// Emit event: deployment reached a terminal state.
pub fn emit_deploy_finished(run_id: &str, state: &str, duration_ms: u64, failed_targets: usize) {
    info!(
        event = "deploy.finished",
        run_id = %run_id,
        state = %state,
        duration_ms = duration_ms,
        failed_targets = failed_targets,
    );
}

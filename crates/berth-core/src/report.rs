//! Deployment reports and dry-run plans.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::ExecError;
use crate::executor::{millis, StepResult};
use crate::orchestrator::Strategy;
use crate::state::{RunState, TargetStatus};

/// Serialized form of an [`ExecError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub message: String,
}

impl From<&ExecError> for ErrorRecord {
    fn from(err: &ExecError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn serialize_error<S: Serializer>(
    err: &Option<ExecError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    err.as_ref().map(ErrorRecord::from).serialize(serializer)
}

pub(crate) fn serialize_millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(millis(*d))
}

/// Outcome for one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub host: String,
    /// `user@host:port` as connected.
    pub endpoint: String,
    pub roles: Vec<String>,
    pub status: TargetStatus,
    pub steps: Vec<StepResult>,
    #[serde(serialize_with = "serialize_error")]
    pub first_error: Option<ExecError>,
}

impl TargetReport {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// Final, immutable result of a deployment run.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub run_id: Uuid,
    pub stage: String,
    pub strategy: Strategy,
    pub state: RunState,
    pub stage_digest: String,
    pub release: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// One entry per target, in host declaration order.
    pub targets: Vec<TargetReport>,
}

impl DeployReport {
    pub fn target(&self, host: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.host == host)
    }

    pub fn exit_code(&self) -> u8 {
        self.state.exit_code()
    }

    pub fn failed_targets(&self) -> usize {
        self.targets.iter().filter(|t| t.status.is_failure()).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "deploy {} ({}) {}: {} in {}ms",
            self.stage,
            self.strategy,
            self.run_id,
            self.state,
            millis(self.duration)
        );
        let _ = writeln!(
            out,
            "stage digest {}  release {}",
            short_digest(&self.stage_digest),
            self.release
        );
        for target in &self.targets {
            let _ = writeln!(
                out,
                "  {} [{}] {}",
                target.endpoint,
                target.roles.join(","),
                target.status
            );
            for step in &target.steps {
                let outcome = match &step.error {
                    None => "ok".to_string(),
                    Some(err) => err.to_string(),
                };
                let _ = writeln!(
                    out,
                    "    {:<16} {:>6}ms  {}",
                    step.step,
                    millis(step.duration),
                    outcome
                );
            }
        }
        out
    }
}

/// One command a dry run would issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedCommand {
    pub host: String,
    pub endpoint: String,
    pub auth: &'static str,
    pub roles: Vec<String>,
    pub command: String,
}

/// One step of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub step: String,
    pub timeout_ms: u64,
    pub success_codes: Vec<i32>,
    pub commands: Vec<PlannedCommand>,
}

/// What a deployment would do, without connecting anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployPlan {
    pub stage: String,
    pub strategy: Strategy,
    pub stage_digest: String,
    pub release: String,
    pub steps: Vec<PlannedStep>,
}

impl DeployPlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Commands in issue order: step by step for all-at-once, host by host
    /// for rolling.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "plan {} ({}) digest {} release {}",
            self.stage,
            self.strategy,
            short_digest(&self.stage_digest),
            self.release
        );
        match self.strategy {
            Strategy::AllAtOnce => {
                for step in &self.steps {
                    let _ = writeln!(out, "  step {} (timeout {}ms)", step.step, step.timeout_ms);
                    for cmd in &step.commands {
                        let _ = writeln!(out, "    {} ({}): {}", cmd.endpoint, cmd.auth, cmd.command);
                    }
                }
            }
            Strategy::Rolling => {
                let mut hosts: Vec<&PlannedCommand> = Vec::new();
                for cmd in self.steps.iter().flat_map(|s| s.commands.iter()) {
                    if !hosts.iter().any(|h| h.host == cmd.host) {
                        hosts.push(cmd);
                    }
                }
                for host in hosts {
                    let _ = writeln!(out, "  {} ({})", host.endpoint, host.auth);
                    for step in &self.steps {
                        if let Some(cmd) = step.commands.iter().find(|c| c.host == host.host) {
                            let _ = writeln!(out, "    {}: {}", step.step, cmd.command);
                        }
                    }
                }
            }
        }
        out
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;

    fn report() -> DeployReport {
        let error: ExecError = CommandError::Failed {
            step: "restart".to_string(),
            host: "vpn.framsteg.de".to_string(),
            exit_code: 1,
        }
        .into();
        let step = |name: &str, error: Option<ExecError>| StepResult {
            host: "vpn.framsteg.de".to_string(),
            step: name.to_string(),
            command: name.to_string(),
            exit_code: Some(if error.is_some() { 1 } else { 0 }),
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            duration: Duration::from_millis(7),
            error,
        };
        DeployReport {
            run_id: Uuid::new_v4(),
            stage: "production2".to_string(),
            strategy: Strategy::AllAtOnce,
            state: RunState::Aborted,
            stage_digest: "ab".repeat(32),
            release: "20260101000000".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration: Duration::from_millis(1500),
            targets: vec![TargetReport {
                host: "vpn.framsteg.de".to_string(),
                endpoint: "deployer@vpn.framsteg.de:7047".to_string(),
                roles: vec!["www".to_string()],
                status: TargetStatus::PartiallyFailed,
                steps: vec![step("check", None), step("restart", Some(error.clone()))],
                first_error: Some(error),
            }],
        }
    }

    #[test]
    fn test_json_report_shape() {
        let json: serde_json::Value = serde_json::from_str(&report().to_json().unwrap()).unwrap();
        assert_eq!(json["state"], "aborted");
        assert_eq!(json["strategy"], "all-at-once");
        assert_eq!(json["duration_ms"], 1500);
        let target = &json["targets"][0];
        assert_eq!(target["status"], "partially_failed");
        assert_eq!(target["first_error"]["kind"], "command");
        assert_eq!(target["steps"][0]["duration_ms"], 7);
        assert!(target["steps"][0]["error"].is_null());
    }

    #[test]
    fn test_text_report_lists_every_target() {
        let text = report().render_text();
        assert!(text.contains("deploy production2 (all-at-once)"));
        assert!(text.contains("deployer@vpn.framsteg.de:7047 [www] partially_failed"));
        assert!(text.contains("exited with status 1"));
        assert!(text.contains("abababababab"));
    }

    #[test]
    fn test_counts_failed_targets() {
        let r = report();
        assert_eq!(r.failed_targets(), 1);
        assert_eq!(r.exit_code(), 2);
        assert!(r.target("vpn.framsteg.de").unwrap().step("restart").is_some());
    }
}

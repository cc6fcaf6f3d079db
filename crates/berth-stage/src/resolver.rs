//! Connection resolver: expands a stage into ordered execution targets.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::ResolutionError;
use crate::host::AuthMethod;
use crate::stage::{unset_option, Host, Stage, Step};

/// Everything needed to open a session to one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub user: Option<String>,
    pub auth: AuthMethod,
    /// All usable key files, the first of which is the `auth` key.
    pub identities: Vec<PathBuf>,
    pub connect_timeout: Duration,
    pub forward_agent: bool,
}

impl Endpoint {
    /// `user@host` (or just `host`) as passed to an SSH client.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// A host selected for a step, with the roles that caused its selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTarget {
    pub endpoint: Endpoint,
    /// Matching roles, in stage declaration order.
    pub roles: Vec<String>,
    /// Index of the host in the stage's declaration order.
    pub position: usize,
}

impl ExecutionTarget {
    pub fn host(&self) -> &str {
        &self.endpoint.hostname
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

/// A step together with the targets it runs on.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub step: Step,
    pub targets: Vec<ExecutionTarget>,
}

/// A host and the indices of the plan steps that apply to it.
#[derive(Debug, Clone)]
pub struct TargetPlan {
    /// Carries every role of the host.
    pub target: ExecutionTarget,
    pub steps: Vec<usize>,
}

/// Every step of a run resolved up front.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub stage: String,
    /// Stage roles in declaration order.
    pub role_order: Vec<String>,
    pub steps: Vec<ResolvedStep>,
}

impl ResolvedPlan {
    /// Distinct targets of the whole plan, in host declaration order.
    pub fn per_target(&self) -> Vec<TargetPlan> {
        let mut plans: Vec<TargetPlan> = Vec::new();
        for (idx, resolved) in self.steps.iter().enumerate() {
            for target in &resolved.targets {
                match plans
                    .iter_mut()
                    .find(|p| p.target.position == target.position)
                {
                    Some(plan) => {
                        plan.steps.push(idx);
                        for role in &target.roles {
                            if !plan.target.roles.contains(role) {
                                plan.target.roles.push(role.clone());
                            }
                        }
                    }
                    None => plans.push(TargetPlan {
                        target: target.clone(),
                        steps: vec![idx],
                    }),
                }
            }
        }
        for plan in &mut plans {
            plan.target
                .roles
                .sort_by_key(|role| self.role_order.iter().position(|r| r == role));
        }
        plans.sort_by_key(|p| p.target.position);
        plans
    }
}

/// Applies runtime connection defaults to stage hosts.
#[derive(Debug, Clone)]
pub struct Resolver {
    default_port: u16,
    default_user: Option<String>,
    connect_timeout: Duration,
}

impl Resolver {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            default_port: config.default_port,
            default_user: config.default_user.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    /// Hosts possessing at least one role in `role_filter`, in declaration
    /// order. An empty filter selects every host.
    pub fn resolve_targets(
        &self,
        stage: &Stage,
        role_filter: &[String],
    ) -> Result<Vec<ExecutionTarget>, ResolutionError> {
        for role in role_filter {
            if stage.role(role).is_none() {
                return Err(ResolutionError::UnknownRole {
                    stage: stage.name().to_string(),
                    role: role.clone(),
                });
            }
        }

        let targets: Vec<ExecutionTarget> = stage
            .hosts()
            .iter()
            .enumerate()
            .filter_map(|(position, host)| {
                let roles: Vec<String> = host
                    .roles
                    .iter()
                    .filter(|r| role_filter.is_empty() || role_filter.contains(r))
                    .cloned()
                    .collect();
                if roles.is_empty() {
                    return None;
                }
                Some(ExecutionTarget {
                    endpoint: self.endpoint(stage, host),
                    roles,
                    position,
                })
            })
            .collect();

        if targets.is_empty() {
            return Err(ResolutionError::NoMatchingHosts {
                stage: stage.name().to_string(),
                filter: role_filter.to_vec(),
            });
        }

        debug!(
            stage = %stage.name(),
            filter = ?role_filter,
            targets = targets.len(),
            "targets resolved"
        );
        Ok(targets)
    }

    /// Resolve every step before anything runs, so a resolution error aborts
    /// the run with no remote side effect.
    ///
    /// Steps built outside the stage file are checked here for `[set]`
    /// options they need, and `{user}` needs a user on every target.
    pub fn resolve_plan(
        &self,
        stage: &Stage,
        steps: &[Step],
    ) -> Result<ResolvedPlan, ResolutionError> {
        if steps.is_empty() {
            return Err(ResolutionError::NoSteps {
                stage: stage.name().to_string(),
            });
        }
        let steps = steps
            .iter()
            .map(|step| {
                if let Some(option) = unset_option(stage.options(), step) {
                    return Err(ResolutionError::UnsetOption {
                        stage: stage.name().to_string(),
                        step: step.name.clone(),
                        option: option.key(),
                    });
                }
                let targets = self.resolve_targets(stage, &step.roles)?;
                if step.uses_placeholder("user") {
                    if let Some(target) = targets.iter().find(|t| t.endpoint.user.is_none()) {
                        return Err(ResolutionError::NoUser {
                            stage: stage.name().to_string(),
                            step: step.name.clone(),
                            host: target.host().to_string(),
                        });
                    }
                }
                Ok(ResolvedStep {
                    step: step.clone(),
                    targets,
                })
            })
            .collect::<Result<Vec<_>, ResolutionError>>()?;
        Ok(ResolvedPlan {
            stage: stage.name().to_string(),
            role_order: stage.roles().iter().map(|r| r.name.clone()).collect(),
            steps,
        })
    }

    /// Port, user and auth for one host.
    ///
    /// Port and user: host value, then `[ssh_options]`, then runtime default.
    /// Auth: the host's password secret, then the first key file, then the agent.
    pub fn endpoint(&self, stage: &Stage, host: &Host) -> Endpoint {
        let ssh = stage.ssh();
        let auth = match (&host.password, ssh.identities.first()) {
            (Some(password), _) => AuthMethod::Password(password.clone()),
            (None, Some(key)) => AuthMethod::KeyFile(key.clone()),
            (None, None) => AuthMethod::Agent,
        };
        Endpoint {
            hostname: host.hostname.clone(),
            port: host.port.or(ssh.port).unwrap_or(self.default_port),
            user: host
                .user
                .clone()
                .or_else(|| ssh.user.clone())
                .or_else(|| self.default_user.clone()),
            auth,
            identities: ssh.identities.clone(),
            connect_timeout: ssh.connect_timeout.unwrap_or(self.connect_timeout),
            forward_agent: ssh.forward_agent,
        }
    }
}

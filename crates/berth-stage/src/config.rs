//! Runtime configuration threaded through the registry, resolver and executor.
//!
//! There is no process-wide default: every component receives a
//! `RuntimeConfig` (or a copy of the fields it needs) at construction.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Immutable runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Directory holding `<stage>.toml` files and the optional `deploy.toml`.
    pub stages_dir: PathBuf,
    /// Base for relative key paths in stage files.
    pub project_root: PathBuf,
    pub default_port: u16,
    pub default_user: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Worker pool size for all-at-once steps.
    pub max_parallel: usize,
    /// Targets deployed concurrently by the rolling strategy.
    pub batch_size: usize,
    /// Time in-flight commands get to finish after cancellation.
    pub cancel_grace: Duration,
    pub ssh_program: PathBuf,
    pub sshpass_program: PathBuf,
    /// Where SSH control sockets are created.
    pub control_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stages_dir: PathBuf::from("config/deploy"),
            project_root: PathBuf::from("."),
            default_port: 22,
            default_user: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            max_parallel: 8,
            batch_size: 1,
            cancel_grace: Duration::from_secs(5),
            ssh_program: PathBuf::from("ssh"),
            sshpass_program: PathBuf::from("sshpass"),
            control_dir: std::env::temp_dir(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `BERTH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("BERTH_STAGES_DIR") {
            config.stages_dir = PathBuf::from(dir);
        }
        if let Some(root) = lookup("BERTH_PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }
        if let Some(port) = lookup("BERTH_DEFAULT_PORT") {
            config.default_port = parse_env("BERTH_DEFAULT_PORT", &port, |p: &u16| *p > 0)?;
        }
        if let Some(user) = lookup("BERTH_DEFAULT_USER") {
            config.default_user = Some(user).filter(|u| !u.is_empty());
        }
        if let Some(secs) = lookup("BERTH_CONNECT_TIMEOUT_SECS") {
            let secs = parse_env("BERTH_CONNECT_TIMEOUT_SECS", &secs, |s: &u64| *s > 0)?;
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("BERTH_COMMAND_TIMEOUT_SECS") {
            let secs = parse_env("BERTH_COMMAND_TIMEOUT_SECS", &secs, |s: &u64| *s > 0)?;
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = lookup("BERTH_MAX_PARALLEL") {
            config.max_parallel = parse_env("BERTH_MAX_PARALLEL", &n, |n: &usize| *n > 0)?;
        }
        if let Some(n) = lookup("BERTH_BATCH_SIZE") {
            config.batch_size = parse_env("BERTH_BATCH_SIZE", &n, |n: &usize| *n > 0)?;
        }
        if let Some(secs) = lookup("BERTH_CANCEL_GRACE_SECS") {
            let secs = parse_env("BERTH_CANCEL_GRACE_SECS", &secs, |_: &u64| true)?;
            config.cancel_grace = Duration::from_secs(secs);
        }
        if let Some(program) = lookup("BERTH_SSH") {
            config.ssh_program = PathBuf::from(program);
        }
        if let Some(program) = lookup("BERTH_SSHPASS") {
            config.sshpass_program = PathBuf::from(program);
        }
        if let Some(dir) = lookup("BERTH_CONTROL_DIR") {
            config.control_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn with_stages_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stages_dir = dir.into();
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

fn parse_env<T, P>(var: &str, value: &str, valid: P) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    P: Fn(&T) -> bool,
{
    match value.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => Ok(parsed),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
            reason: "out of range or not an integer".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.default_port, 22);
        assert_eq!(cfg.stages_dir, PathBuf::from("config/deploy"));
        assert_eq!(cfg.batch_size, 1);
        assert!(cfg.default_user.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("BERTH_STAGES_DIR", "/etc/berth"),
            ("BERTH_DEFAULT_PORT", "2222"),
            ("BERTH_DEFAULT_USER", "deployer"),
            ("BERTH_MAX_PARALLEL", "3"),
            ("BERTH_CANCEL_GRACE_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(cfg.stages_dir, PathBuf::from("/etc/berth"));
        assert_eq!(cfg.default_port, 2222);
        assert_eq!(cfg.default_user.as_deref(), Some("deployer"));
        assert_eq!(cfg.max_parallel, 3);
        assert_eq!(cfg.cancel_grace, Duration::ZERO);
    }

    #[test]
    fn test_invalid_env_is_config_error() {
        let err = RuntimeConfig::from_lookup(lookup(&[("BERTH_DEFAULT_PORT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "BERTH_DEFAULT_PORT"));

        let err =
            RuntimeConfig::from_lookup(lookup(&[("BERTH_MAX_PARALLEL", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_builders_clamp_pool_sizes() {
        let cfg = RuntimeConfig::default()
            .with_max_parallel(0)
            .with_batch_size(0);
        assert_eq!(cfg.max_parallel, 1);
        assert_eq!(cfg.batch_size, 1);
    }
}

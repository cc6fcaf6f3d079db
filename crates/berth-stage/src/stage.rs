//! Validated stage model.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::definition::{StageDefinition, StepDefinition};
use crate::error::{ConfigError, Result};
use crate::host::HostAddress;
use crate::options::{SecretValue, StageOption, StageOptions};

/// A host declared by a stage, before connection defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Roles in stage declaration order.
    pub roles: Vec<String>,
    pub password: Option<SecretValue>,
}

impl Host {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A role and the hosts assigned to it, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub hosts: Vec<String>,
}

/// `[ssh_options]` after key files were checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshSettings {
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Key files that existed at load time, in declaration order.
    pub identities: Vec<PathBuf>,
    pub connect_timeout: Option<Duration>,
    pub forward_agent: bool,
}

/// One remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    /// Command template; see `berth_core::executor::render_command`.
    pub command: String,
    /// Role filter. Empty runs on every host.
    pub roles: Vec<String>,
    pub success_codes: Vec<i32>,
    pub timeout: Option<Duration>,
    pub within_deploy_to: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            roles: Vec::new(),
            success_codes: vec![0],
            timeout: None,
            within_deploy_to: false,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_success_codes(mut self, codes: Vec<i32>) -> Self {
        self.success_codes = codes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn within_deploy_to(mut self) -> Self {
        self.within_deploy_to = true;
        self
    }

    /// Whether an exit code counts as success for this step.
    pub fn accepts(&self, exit_code: i32) -> bool {
        self.success_codes.contains(&exit_code)
    }

    /// `[set]` options the command cannot be rendered without.
    pub fn required_options(&self) -> Vec<StageOption> {
        let mut required = Vec::new();
        if self.within_deploy_to || self.uses_placeholder("deploy_to") {
            required.push(StageOption::DeployTo);
        }
        if self.uses_placeholder("branch") {
            required.push(StageOption::Branch);
        }
        required
    }

    /// Whether the command template contains `{name}`.
    pub fn uses_placeholder(&self, name: &str) -> bool {
        self.command.contains(&format!("{{{name}}}"))
    }

    fn from_definition(def: &StepDefinition) -> Result<Self> {
        if def.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand(def.name.clone()));
        }
        let success_codes = match &def.success_codes {
            Some(codes) if codes.is_empty() => {
                return Err(ConfigError::InvalidOption {
                    key: format!("step.{}.success_codes", def.name),
                    reason: "must list at least one exit code".to_string(),
                })
            }
            Some(codes) => codes.clone(),
            None => vec![0],
        };
        let timeout = match def.timeout_secs {
            Some(0) => {
                return Err(ConfigError::InvalidOption {
                    key: format!("step.{}.timeout_secs", def.name),
                    reason: "must be greater than zero".to_string(),
                })
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        Ok(Self {
            name: def.name.clone(),
            command: def.command.clone(),
            roles: def.roles.clone(),
            success_codes,
            timeout,
            within_deploy_to: def.within_deploy_to,
        })
    }
}

/// A loaded and validated deployment stage.
#[derive(Clone)]
pub struct Stage {
    name: String,
    roles: Vec<Role>,
    hosts: Vec<Host>,
    ssh: SshSettings,
    options: StageOptions,
    steps: Vec<Step>,
    definition: StageDefinition,
    digest: String,
}

impl Stage {
    /// Validate a definition loaded under `requested`.
    ///
    /// Relative key paths are resolved against `project_root`. Key files are
    /// checked here, once; later connections never re-check them.
    pub fn from_definition(
        requested: &str,
        mut definition: StageDefinition,
        project_root: &Path,
    ) -> Result<Self> {
        validate_stage_name(requested)?;
        if let Some(declared) = &definition.name {
            if declared != requested {
                return Err(ConfigError::NameMismatch {
                    requested: requested.to_string(),
                    declared: declared.clone(),
                });
            }
        }
        definition.name = Some(requested.to_string());
        let name = requested.to_string();

        let options = StageOptions::from_table(&definition.set)?;
        let mut builder = HostTable::default();

        for (role, value) in &definition.roles {
            let list = value.as_array().ok_or_else(|| ConfigError::InvalidOption {
                key: format!("roles.{role}"),
                reason: "expected an array of host strings".to_string(),
            })?;
            if list.is_empty() {
                return Err(ConfigError::EmptyRole {
                    stage: name.clone(),
                    role: role.clone(),
                });
            }
            builder.declare_role(role);
            for item in list {
                let raw = item.as_str().ok_or_else(|| ConfigError::InvalidOption {
                    key: format!("roles.{role}"),
                    reason: "host entries must be strings".to_string(),
                })?;
                let address: HostAddress = raw.parse()?;
                let idx = builder.upsert(address)?;
                builder.assign(idx, role);
            }
        }

        for server in &definition.servers {
            let mut address: HostAddress = server.address.parse()?;
            if server.roles.is_empty() {
                return Err(ConfigError::HostWithoutRole {
                    stage: name.clone(),
                    host: server.address.clone(),
                });
            }
            address.user = merge_field(
                &address.hostname,
                "user",
                address.user.clone(),
                server.user.clone(),
            )?;
            address.port = merge_field(&address.hostname, "port", address.port, server.port)?;
            let idx = builder.upsert(address)?;

            if let Some(secret_key) = &server.password_secret {
                let secret =
                    options
                        .secret(secret_key)
                        .ok_or_else(|| ConfigError::MissingSecret {
                            host: server.address.clone(),
                            secret: secret_key.clone(),
                        })?;
                builder.hosts[idx].password = Some(secret.clone());
            }

            for role in &server.roles {
                if role.trim().is_empty() {
                    return Err(ConfigError::InvalidOption {
                        key: format!("server.{}.roles", server.address),
                        reason: "role names must not be empty".to_string(),
                    });
                }
                builder.declare_role(role);
                builder.assign(idx, role);
            }
        }

        if builder.hosts.is_empty() {
            return Err(ConfigError::NoHosts { stage: name });
        }

        let ssh = resolve_ssh(&name, &definition, project_root)?;

        let mut steps: Vec<Step> = Vec::with_capacity(definition.steps.len());
        for def in &definition.steps {
            if steps.iter().any(|s| s.name == def.name) {
                return Err(ConfigError::DuplicateStep(def.name.clone()));
            }
            let step = Step::from_definition(def)?;
            if let Some(option) = unset_option(&options, &step) {
                return Err(ConfigError::UnsetOption {
                    step: step.name.clone(),
                    option: option.key(),
                });
            }
            for role in &step.roles {
                if !builder.roles.iter().any(|r| &r.name == role) {
                    return Err(ConfigError::UnknownStepRole {
                        step: step.name.clone(),
                        role: role.clone(),
                    });
                }
            }
            steps.push(step);
        }

        let canonical = definition.to_toml().map_err(|e| ConfigError::Serialize {
            stage: name.clone(),
            message: e.to_string(),
        })?;
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));

        debug!(
            stage = %name,
            hosts = builder.hosts.len(),
            roles = builder.roles.len(),
            steps = steps.len(),
            "stage validated"
        );

        Ok(Self {
            name,
            roles: builder.roles,
            hosts: builder.hosts,
            ssh,
            options,
            steps,
            definition,
            digest,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Roles in declaration order.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Hosts in first-declared order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn ssh(&self) -> &SshSettings {
        &self.ssh
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Pick steps by name, in the order requested. An empty request selects
    /// every declared step.
    pub fn select_steps(&self, names: &[String]) -> Result<Vec<Step>> {
        if names.is_empty() {
            return Ok(self.steps.clone());
        }
        let mut selected: Vec<Step> = Vec::with_capacity(names.len());
        for name in names {
            if selected.iter().any(|s| &s.name == name) {
                return Err(ConfigError::DuplicateStep(name.clone()));
            }
            let step = self
                .step(name)
                .ok_or_else(|| ConfigError::UnknownStep(name.clone()))?;
            selected.push(step.clone());
        }
        Ok(selected)
    }

    /// The declared definition this stage was built from.
    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    /// Serialize the stage back into its file format.
    pub fn to_toml(&self) -> Result<String> {
        self.definition
            .to_toml()
            .map_err(|e| ConfigError::Serialize {
                stage: self.name.clone(),
                message: e.to_string(),
            })
    }

    /// SHA-256 hex digest of the canonical serialized definition.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

// The raw definition holds secret values in plain text, so it is left out.
impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .field("hosts", &self.hosts)
            .field("ssh", &self.ssh)
            .field("options", &self.options)
            .field("steps", &self.steps)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// First option `step` needs that `options` leaves unset.
pub(crate) fn unset_option(options: &StageOptions, step: &Step) -> Option<StageOption> {
    step.required_options()
        .into_iter()
        .find(|option| options.get(*option).is_none())
}

pub(crate) fn validate_stage_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidStageName(name.to_string()))
    }
}

#[derive(Default)]
struct HostTable {
    hosts: Vec<Host>,
    index: HashMap<String, usize>,
    roles: Vec<Role>,
}

impl HostTable {
    fn upsert(&mut self, address: HostAddress) -> Result<usize> {
        if let Some(&idx) = self.index.get(&address.hostname) {
            let host = &mut self.hosts[idx];
            host.user = merge_field(&host.hostname, "user", host.user.clone(), address.user)?;
            host.port = merge_field(&host.hostname, "port", host.port, address.port)?;
            return Ok(idx);
        }
        let idx = self.hosts.len();
        self.index.insert(address.hostname.clone(), idx);
        self.hosts.push(Host {
            hostname: address.hostname,
            user: address.user,
            port: address.port,
            roles: Vec::new(),
            password: None,
        });
        Ok(idx)
    }

    fn declare_role(&mut self, role: &str) {
        if !self.roles.iter().any(|r| r.name == role) {
            self.roles.push(Role {
                name: role.to_string(),
                hosts: Vec::new(),
            });
        }
    }

    fn assign(&mut self, idx: usize, role: &str) {
        let host = &mut self.hosts[idx];
        if !host.has_role(role) {
            host.roles.push(role.to_string());
        }
        if let Some(entry) = self.roles.iter_mut().find(|r| r.name == role) {
            if !entry.hosts.contains(&host.hostname) {
                entry.hosts.push(host.hostname.clone());
            }
        }
        // Keep each host's roles in stage declaration order.
        let order: Vec<&str> = self.roles.iter().map(|r| r.name.as_str()).collect();
        host.roles
            .sort_by_key(|r| order.iter().position(|o| *o == r.as_str()).unwrap_or(usize::MAX));
    }
}

fn merge_field<T>(host: &str, field: &'static str, first: Option<T>, second: Option<T>) -> Result<Option<T>>
where
    T: PartialEq + ToString,
{
    match (first, second) {
        (Some(a), Some(b)) if a != b => Err(ConfigError::ConflictingHost {
            host: host.to_string(),
            field,
            first: a.to_string(),
            second: b.to_string(),
        }),
        (Some(a), _) => Ok(Some(a)),
        (None, b) => Ok(b),
    }
}

fn resolve_ssh(stage: &str, definition: &StageDefinition, project_root: &Path) -> Result<SshSettings> {
    let opts = &definition.ssh_options;
    let connect_timeout = match opts.connect_timeout_secs {
        Some(0) => {
            return Err(ConfigError::InvalidOption {
                key: "ssh_options.connect_timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            })
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };
    if opts.port == Some(0) {
        return Err(ConfigError::InvalidOption {
            key: "ssh_options.port".to_string(),
            reason: "must be in 1..=65535".to_string(),
        });
    }

    let mut identities = Vec::new();
    for key in &opts.keys {
        let path = absolutize(project_root, key);
        if path.is_file() {
            identities.push(path);
        } else {
            warn!(stage = %stage, key = %path.display(), "ssh key file not found, skipping it");
        }
    }
    for key in &opts.keys_if_exist {
        let path = absolutize(project_root, key);
        if path.is_file() {
            if !identities.contains(&path) {
                identities.push(path);
            }
        } else {
            debug!(stage = %stage, key = %path.display(), "optional ssh key absent");
        }
    }

    Ok(SshSettings {
        port: opts.port,
        user: opts.user.clone(),
        identities,
        connect_timeout,
        forward_agent: opts.forward_agent.unwrap_or(false),
    })
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(src: &str) -> Result<Stage> {
        let def = StageDefinition::from_toml(src).expect("valid toml");
        Stage::from_definition("production2", def, Path::new("/nonexistent-root"))
    }

    #[test]
    fn test_hosts_merge_roles_in_declaration_order() {
        let stage = load(
            r#"
            [roles]
            www = ["deployer@web1", "web2"]
            app = ["web2:2222", "app1"]

            [[server]]
            address = "web1"
            roles = ["db", "www"]
            "#,
        )
        .unwrap();

        let names: Vec<_> = stage.hosts().iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, vec!["web1", "web2", "app1"]);
        let role_names: Vec<_> = stage.roles().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(role_names, vec!["www", "app", "db"]);

        let web1 = &stage.hosts()[0];
        assert_eq!(web1.user.as_deref(), Some("deployer"));
        assert_eq!(web1.roles, vec!["www", "db"]);
        let web2 = &stage.hosts()[1];
        assert_eq!(web2.port, Some(2222));
        assert_eq!(web2.roles, vec!["www", "app"]);
    }

    #[test]
    fn test_conflicting_user_is_rejected() {
        let err = load(
            r#"
            [roles]
            www = ["deployer@web1"]

            [[server]]
            address = "web1"
            user = "root"
            roles = ["www"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingHost { field: "user", .. }));
    }

    #[test]
    fn test_empty_stage_is_rejected() {
        let err = load("[set]\ndeploy_to = \"/srv\"").unwrap_err();
        assert!(matches!(err, ConfigError::NoHosts { .. }));

        let err = load("[roles]\nwww = []").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRole { .. }));
    }

    #[test]
    fn test_server_without_role_is_rejected() {
        let err = load("[[server]]\naddress = \"web1\"").unwrap_err();
        assert!(matches!(err, ConfigError::HostWithoutRole { .. }));
    }

    #[test]
    fn test_malformed_address_is_rejected() {
        let err = load("[roles]\nwww = [\"web 1\"]").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }

    #[test]
    fn test_name_mismatch_is_rejected() {
        let err = load("name = \"staging\"\n[roles]\nwww = [\"web1\"]").unwrap_err();
        assert!(matches!(err, ConfigError::NameMismatch { .. }));
    }

    #[test]
    fn test_step_roles_must_exist() {
        let err = load(
            r#"
            [roles]
            www = ["web1"]

            [[step]]
            name = "migrate"
            command = "rake db:migrate"
            roles = ["db"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStepRole { ref role, .. } if role == "db"));
    }

    #[test]
    fn test_duplicate_and_empty_steps_are_rejected() {
        let err = load(
            r#"
            [roles]
            www = ["web1"]
            [[step]]
            name = "check"
            command = "true"
            [[step]]
            name = "check"
            command = "false"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStep(_)));

        let err = load("[roles]\nwww = [\"web1\"]\n[[step]]\nname = \"x\"\ncommand = \"  \"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand(_)));
    }

    #[test]
    fn test_steps_using_unset_options_are_rejected() {
        let err = load(
            r#"
            [roles]
            www = ["web1"]
            [[step]]
            name = "cleanup"
            command = "rm -rf {deploy_to}/releases/old"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnsetOption { ref step, option: "deploy_to" } if step == "cleanup"
        ));

        let err = load(
            r#"
            [roles]
            www = ["web1"]
            [[step]]
            name = "restart"
            command = "touch tmp/restart.txt"
            within_deploy_to = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsetOption { option: "deploy_to", .. }));

        let err = load(
            r#"
            [roles]
            www = ["web1"]
            [set]
            deploy_to = "/srv/app"
            [[step]]
            name = "checkout"
            command = "git -C {deploy_to}/repo checkout {branch}"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsetOption { option: "branch", .. }));
    }

    #[test]
    fn test_password_secret_must_exist() {
        let err = load(
            r#"
            [[server]]
            address = "web1"
            roles = ["www"]
            password_secret = "web_pass"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret { .. }));

        let stage = load(
            r#"
            [[server]]
            address = "web1"
            roles = ["www"]
            password_secret = "web_pass"

            [set]
            web_pass = "pa55"
            "#,
        )
        .unwrap();
        assert_eq!(stage.hosts()[0].password.as_ref().unwrap().expose(), "pa55");
    }

    #[test]
    fn test_missing_keys_are_not_fatal() {
        let stage = load(
            r#"
            [roles]
            www = ["web1"]

            [ssh_options]
            keys = ["config/missing_id_rsa"]
            keys_if_exist = ["config/deploy_id_rsa"]
            "#,
        )
        .unwrap();
        assert!(stage.ssh().identities.is_empty());
    }

    #[test]
    fn test_select_steps_preserves_requested_order() {
        let stage = load(
            r#"
            [roles]
            www = ["web1"]
            [[step]]
            name = "check"
            command = "true"
            [[step]]
            name = "restart"
            command = "true"
            "#,
        )
        .unwrap();

        let all = stage.select_steps(&[]).unwrap();
        assert_eq!(all.len(), 2);

        let picked = stage
            .select_steps(&["restart".to_string(), "check".to_string()])
            .unwrap();
        assert_eq!(picked[0].name, "restart");
        assert_eq!(picked[1].name, "check");

        let err = stage.select_steps(&["deploy".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStep(_)));
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let src = "[roles]\nwww = [\"web1\"]";
        let a = load(src).unwrap();
        let b = load(src).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let c = load("[roles]\nwww = [\"web2\"]").unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_stage_name_validation() {
        assert!(validate_stage_name("production2").is_ok());
        assert!(validate_stage_name("eu-west.1").is_ok());
        assert!(validate_stage_name("../etc").is_err());
        assert!(validate_stage_name("").is_err());
        assert!(validate_stage_name("a/b").is_err());
    }

    #[test]
    fn test_step_accepts_configured_codes() {
        let step = Step::new("grep", "grep -q x file").with_success_codes(vec![0, 1]);
        assert!(step.accepts(0));
        assert!(step.accepts(1));
        assert!(!step.accepts(2));
    }
}

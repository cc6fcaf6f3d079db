//! On-disk stage file format.
//!
//! These types mirror the TOML layout one-to-one. Validation and resolution
//! happen when a [`StageDefinition`] is turned into a [`crate::Stage`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A stage file (`<stages_dir>/<name>.toml`) or the shared `deploy.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Role name to host strings, in declaration order.
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub roles: toml::Table,

    #[serde(default, rename = "server", skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerDefinition>,

    #[serde(default, skip_serializing_if = "SshOptionsDefinition::is_empty")]
    pub ssh_options: SshOptionsDefinition,

    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub set: toml::Table,

    #[serde(default, rename = "step", skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDefinition>,
}

/// An explicit `[[server]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerDefinition {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Name of a `[set]` secret holding the login password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,
}

/// `[ssh_options]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshOptionsDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Keys always offered; a missing file is reported as a warning.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<PathBuf>,
    /// Keys offered only when the file exists at load time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys_if_exist: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_agent: Option<bool>,
}

impl SshOptionsDefinition {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Field-wise overlay: values set in `self` win over `defaults`.
    fn overlay(self, defaults: SshOptionsDefinition) -> Self {
        Self {
            port: self.port.or(defaults.port),
            user: self.user.or(defaults.user),
            keys: if self.keys.is_empty() {
                defaults.keys
            } else {
                self.keys
            },
            keys_if_exist: if self.keys_if_exist.is_empty() {
                defaults.keys_if_exist
            } else {
                self.keys_if_exist
            },
            connect_timeout_secs: self.connect_timeout_secs.or(defaults.connect_timeout_secs),
            forward_agent: self.forward_agent.or(defaults.forward_agent),
        }
    }
}

/// A `[[step]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub name: String,
    pub command: String,
    /// Roles the step runs on; empty means every role.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_codes: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub within_deploy_to: bool,
}

impl StageDefinition {
    /// Parse a stage file body.
    pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// Whether this definition only carries shareable sections.
    pub fn is_shareable(&self) -> bool {
        self.name.is_none() && self.roles.is_empty() && self.servers.is_empty()
    }

    /// Apply shared defaults underneath this stage.
    ///
    /// Stage `[set]` keys override shared ones, `[ssh_options]` overlay field
    /// by field, and a stage step replaces the shared step of the same name.
    /// Steps only declared by the stage are appended after the shared ones.
    pub fn with_defaults(self, shared: StageDefinition) -> StageDefinition {
        let mut set = shared.set;
        for (key, value) in self.set {
            set.insert(key, value);
        }

        let mut steps = shared.steps;
        for step in self.steps {
            match steps.iter_mut().find(|s| s.name == step.name) {
                Some(existing) => *existing = step,
                None => steps.push(step),
            }
        }

        StageDefinition {
            name: self.name,
            roles: self.roles,
            servers: self.servers,
            ssh_options: self.ssh_options.overlay(shared.ssh_options),
            set,
            steps,
        }
    }
}

//! Stage options: a closed set of recognized keys plus opaque secrets.
//!
//! `[set]` entries whose key is a [`StageOption`] are type-checked and exposed
//! through accessors on [`StageOptions`]. Every other key is kept as a
//! [`SecretValue`] that the core never interprets and never logs.

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// An opaque string that must not appear in logs or debug output.
pub struct SecretValue(SecretString);

impl SecretValue {
    /// Borrow the underlying value. Call sites are the only places a secret
    /// leaves this wrapper.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self(SecretString::from(value.to_string()))
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(SecretString::from(value))
    }
}

impl Clone for SecretValue {
    fn clone(&self) -> Self {
        Self::from(self.expose())
    }
}

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for SecretValue {}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for SecretValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Recognized `[set]` keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageOption {
    /// Remote directory the application is deployed into.
    DeployTo,
    Application,
    Branch,
    /// Number of old releases kept on each host.
    KeepReleases,
    /// Shell used to wrap remote commands.
    DefaultShell,
}

impl StageOption {
    pub const ALL: [StageOption; 5] = [
        StageOption::DeployTo,
        StageOption::Application,
        StageOption::Branch,
        StageOption::KeepReleases,
        StageOption::DefaultShell,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            StageOption::DeployTo => "deploy_to",
            StageOption::Application => "application",
            StageOption::Branch => "branch",
            StageOption::KeepReleases => "keep_releases",
            StageOption::DefaultShell => "default_shell",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.key() == key)
    }

    fn is_integer(&self) -> bool {
        matches!(self, StageOption::KeepReleases)
    }
}

/// Typed value of a recognized option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Text(String),
    Integer(i64),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(s) => f.write_str(s),
            OptionValue::Integer(i) => write!(f, "{i}"),
        }
    }
}

/// Options set for a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOptions {
    known: BTreeMap<StageOption, OptionValue>,
    secrets: BTreeMap<String, SecretValue>,
}

impl StageOptions {
    /// Build options from a `[set]` table.
    pub fn from_table(table: &toml::Table) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        for (key, value) in table {
            match StageOption::from_key(key) {
                Some(option) => {
                    let typed = typed_value(option, key, value)?;
                    options.known.insert(option, typed);
                }
                None => {
                    let text = scalar_text(key, value)?;
                    options.secrets.insert(key.clone(), SecretValue::from(text));
                }
            }
        }
        Ok(options)
    }

    pub fn get(&self, option: StageOption) -> Option<&OptionValue> {
        self.known.get(&option)
    }

    fn text(&self, option: StageOption) -> Option<&str> {
        match self.known.get(&option) {
            Some(OptionValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn deploy_to(&self) -> Option<&str> {
        self.text(StageOption::DeployTo)
    }

    pub fn application(&self) -> Option<&str> {
        self.text(StageOption::Application)
    }

    pub fn branch(&self) -> Option<&str> {
        self.text(StageOption::Branch)
    }

    pub fn default_shell(&self) -> Option<&str> {
        self.text(StageOption::DefaultShell)
    }

    pub fn keep_releases(&self) -> Option<u32> {
        match self.known.get(&StageOption::KeepReleases) {
            Some(OptionValue::Integer(n)) => u32::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Look up an opaque secret by key.
    pub fn secret(&self, key: &str) -> Option<&SecretValue> {
        self.secrets.get(key)
    }

    /// Keys of the opaque secrets, sorted.
    pub fn secret_keys(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    /// Recognized options in enum order.
    pub fn known(&self) -> impl Iterator<Item = (StageOption, &OptionValue)> {
        self.known.iter().map(|(k, v)| (*k, v))
    }
}

fn typed_value(
    option: StageOption,
    key: &str,
    value: &toml::Value,
) -> Result<OptionValue, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidOption {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if option.is_integer() {
        match value {
            toml::Value::Integer(n) if *n >= 1 => Ok(OptionValue::Integer(*n)),
            toml::Value::Integer(_) => Err(invalid("must be at least 1")),
            _ => Err(invalid("expected an integer")),
        }
    } else {
        match value {
            toml::Value::String(s) if !s.trim().is_empty() => Ok(OptionValue::Text(s.clone())),
            toml::Value::String(_) => Err(invalid("must not be empty")),
            _ => Err(invalid("expected a string")),
        }
    }
}

fn scalar_text(key: &str, value: &toml::Value) -> Result<String, ConfigError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        _ => Err(ConfigError::InvalidOption {
            key: key.to_string(),
            reason: "custom options must be scalar values".to_string(),
        }),
    }
}

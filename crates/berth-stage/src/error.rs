//! Error types for stage loading and target resolution.

use std::path::PathBuf;

/// Errors produced while loading or validating a stage definition.
///
/// Every variant is fatal: a stage that fails validation is never handed
/// to the executor, so no remote side effect can follow a `ConfigError`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("stage '{stage}' not found (looked for {path})")]
    StageNotFound { stage: String, path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("stage file declares name '{declared}' but was loaded as '{requested}'")]
    NameMismatch { requested: String, declared: String },

    #[error("invalid stage name '{0}'")]
    InvalidStageName(String),

    #[error("stage '{stage}' declares no roles or hosts")]
    NoHosts { stage: String },

    #[error("role '{role}' in stage '{stage}' has no hosts")]
    EmptyRole { stage: String, role: String },

    #[error("server '{host}' in stage '{stage}' is not assigned to any role")]
    HostWithoutRole { stage: String, host: String },

    #[error("malformed host address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("host '{host}' is declared with conflicting {field}: '{first}' vs '{second}'")]
    ConflictingHost {
        host: String,
        field: &'static str,
        first: String,
        second: String,
    },

    #[error("option '{key}' is invalid: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("step '{step}' references unknown role '{role}'")]
    UnknownStepRole { step: String, role: String },

    #[error("step '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error("step '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("step '{step}' uses option '{option}' which is not set")]
    UnsetOption { step: String, option: &'static str },

    #[error("step '{0}' is not declared in this stage")]
    UnknownStep(String),

    #[error("server '{host}' uses password secret '{secret}' which is not set")]
    MissingSecret { host: String, secret: String },

    #[error("shared defaults file {path} may only declare [set], [ssh_options] and [[step]]")]
    InvalidSharedDefaults { path: PathBuf },

    #[error("environment variable {var} has invalid value '{value}': {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("failed to serialize stage '{stage}': {message}")]
    Serialize { stage: String, message: String },
}

/// Errors produced while expanding a stage into execution targets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("role filter {filter:?} matches no host in stage '{stage}'")]
    NoMatchingHosts { stage: String, filter: Vec<String> },

    #[error("role '{role}' is not declared in stage '{stage}'")]
    UnknownRole { stage: String, role: String },

    #[error("no steps to run for stage '{stage}'")]
    NoSteps { stage: String },

    #[error("step '{step}' uses option '{option}' which stage '{stage}' does not set")]
    UnsetOption {
        stage: String,
        step: String,
        option: &'static str,
    },

    #[error("step '{step}' uses {{user}} but no user is configured for {host}")]
    NoUser { stage: String, step: String, host: String },
}

/// Result type for stage loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

//! Berth Stage Library
//!
//! Stage definitions, the stage registry and the connection resolver.

pub mod config;
pub mod definition;
pub mod error;
pub mod host;
pub mod options;
pub mod registry;
pub mod resolver;
pub mod stage;

pub use config::RuntimeConfig;
pub use definition::{ServerDefinition, SshOptionsDefinition, StageDefinition, StepDefinition};
pub use error::{ConfigError, ResolutionError, Result};
pub use host::{AuthMethod, HostAddress};
pub use options::{OptionValue, SecretValue, StageOption, StageOptions};
pub use registry::{StageRegistry, SHARED_DEFAULTS_FILE};
pub use resolver::{
    Endpoint, ExecutionTarget, ResolvedPlan, ResolvedStep, Resolver, TargetPlan,
};
pub use stage::{Host, Role, SshSettings, Stage, Step};

//! Berth Core Library
//!
//! Remote step execution, rollout orchestration, run reports and the
//! ambient tracing setup shared by the `berth` binary.

pub mod cancel;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod report;
pub mod ssh;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use cancel::{CancelHandle, CancelToken};
pub use error::{
    CommandError, ConnectionError, DeployError, DeployResult, ExecError, ParseStrategyError,
};
pub use executor::{release_stamp, render_command, Executor, StepContext, StepResult};
pub use orchestrator::{Orchestrator, Strategy};
pub use report::{DeployPlan, DeployReport, ErrorRecord, PlannedCommand, PlannedStep, TargetReport};
pub use ssh::SshTransport;
pub use state::{RunState, RunStateMachine, TargetStatus};
pub use transport::{CommandOutput, Session, Transport};

pub use berth_stage::{
    ConfigError, ExecutionTarget, ResolutionError, RuntimeConfig, Stage, StageRegistry, Step,
};

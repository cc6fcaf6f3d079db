//! berth - stage-based remote deployment CLI
//!
//! ## Commands
//!
//! - `deploy`: Run a stage's steps on its hosts
//! - `plan`: Show what `deploy` would run, without connecting
//! - `stages`: List the stages in the stages directory
//! - `show`: Print a resolved stage with secrets redacted

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_core::telemetry::{init_tracing, level_for_verbosity};
use berth_core::{obs, CancelHandle, DeployError, Orchestrator, RunState, Strategy};
use berth_stage::{ConfigError, ResolutionError, Resolver, RuntimeConfig, Stage, StageRegistry};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{debug, info};

/// Exit status for configuration and resolution errors.
const EXIT_CONFIG: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Stage-based remote deployment", long_about = None)]
struct Cli {
    /// Directory holding stage files
    #[arg(long, global = true, env = "BERTH_STAGES_DIR")]
    stages_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a stage's steps on its hosts
    Deploy {
        #[command(flatten)]
        run: RunArgs,

        /// Resolve and print the plan without connecting
        #[arg(long)]
        dry_run: bool,

        /// Report format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        report: OutputFormat,
    },

    /// Show what `deploy` would run (same as `deploy --dry-run`)
    Plan {
        #[command(flatten)]
        run: RunArgs,

        /// Plan format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        report: OutputFormat,
    },

    /// List available stages
    Stages {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        report: OutputFormat,
    },

    /// Print a resolved stage with secrets redacted
    Show {
        /// Stage name
        stage: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        report: OutputFormat,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Stage name
    stage: String,

    /// Steps to run, in order (default: every step of the stage)
    #[arg(long, value_delimiter = ',')]
    steps: Vec<String>,

    /// Rollout strategy: all-at-once or rolling
    #[arg(long, env = "BERTH_STRATEGY")]
    strategy: Option<Strategy>,

    /// Targets deployed concurrently by the rolling strategy
    #[arg(long)]
    batch_size: Option<usize>,

    /// Worker pool size for all-at-once steps
    #[arg(long)]
    max_parallel: Option<usize>,
}

impl RunArgs {
    fn strategy(&self) -> Result<Strategy, ConfigError> {
        self.strategy.ok_or_else(|| ConfigError::InvalidOption {
            key: "strategy".to_string(),
            reason: "no rollout strategy chosen; pass --strategy or set BERTH_STRATEGY"
                .to_string(),
        })
    }

    fn apply(&self, mut config: RuntimeConfig) -> Result<RuntimeConfig, ConfigError> {
        if let Some(n) = self.batch_size {
            config = config.with_batch_size(positive("batch-size", n)?);
        }
        if let Some(n) = self.max_parallel {
            config = config.with_max_parallel(positive("max-parallel", n)?);
        }
        Ok(config)
    }
}

fn positive(flag: &str, n: usize) -> Result<usize, ConfigError> {
    if n == 0 {
        return Err(ConfigError::InvalidOption {
            key: flag.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_CONFIG } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    init_tracing(cli.json, level_for_verbosity(cli.verbose));

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(dir) = cli.stages_dir {
        config = config.with_stages_dir(dir);
    }
    debug!(stages_dir = %config.stages_dir.display(), "runtime config loaded");

    match cli.command {
        Commands::Deploy {
            run,
            dry_run,
            report,
        } => {
            if dry_run {
                cmd_plan(config, &run, report)
            } else {
                cmd_deploy(config, &run, report).await
            }
        }
        Commands::Plan { run, report } => cmd_plan(config, &run, report),
        Commands::Stages { report } => cmd_stages(&config, report),
        Commands::Show { stage, report } => cmd_show(&config, &stage, report),
    }
}

/// Map a failure to the process exit status.
///
/// Configuration and resolution problems exit 3; anything else stopped the
/// run and counts as aborted.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some()
            || cause.downcast_ref::<ResolutionError>().is_some()
        {
            return EXIT_CONFIG;
        }
        if let Some(DeployError::Config(_) | DeployError::Resolution(_)) =
            cause.downcast_ref::<DeployError>()
        {
            return EXIT_CONFIG;
        }
    }
    RunState::Aborted.exit_code()
}

fn load(config: &RuntimeConfig, run: &RunArgs) -> Result<(Stage, Vec<berth_stage::Step>)> {
    let registry = StageRegistry::new(config);
    let stage = registry
        .load_stage(&run.stage)
        .with_context(|| format!("loading stage '{}'", run.stage))?;
    let steps = stage.select_steps(&run.steps)?;
    Ok((stage, steps))
}

fn cmd_plan(config: RuntimeConfig, run: &RunArgs, format: OutputFormat) -> Result<u8> {
    let strategy = run.strategy()?;
    let config = run.apply(config)?;
    let (stage, steps) = load(&config, run)?;

    let plan = Orchestrator::with_ssh(&config).plan(&stage, &steps, strategy)?;
    match format {
        OutputFormat::Text => print!("{}", plan.render_text()),
        OutputFormat::Json => println!("{}", plan.to_json()?),
    }
    Ok(0)
}

async fn cmd_deploy(config: RuntimeConfig, run: &RunArgs, format: OutputFormat) -> Result<u8> {
    let strategy = run.strategy()?;
    let config = run.apply(config)?;
    let (stage, steps) = load(&config, run)?;

    let cancel = CancelHandle::new();
    let watcher = tokio::spawn(watch_interrupts(
        cancel.clone(),
        stage.name().to_string(),
        config.cancel_grace,
    ));

    info!(stage = %stage.name(), strategy = %strategy, steps = steps.len(), "starting deployment");
    let result = Orchestrator::with_ssh(&config)
        .deploy_with_cancel(&stage, &steps, strategy, cancel.token())
        .await;
    watcher.abort();
    let report = result?;

    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }
    Ok(report.exit_code())
}

/// First Ctrl-C cancels the run; a second one exits immediately.
async fn watch_interrupts(cancel: CancelHandle, stage: String, grace: Duration) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    obs::emit_cancel_requested(&stage, grace);
    eprintln!(
        "cancelling: waiting up to {}s for running commands (Ctrl-C again to exit now)",
        grace.as_secs()
    );
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(i32::from(RunState::Aborted.exit_code()));
    }
}

fn cmd_stages(config: &RuntimeConfig, format: OutputFormat) -> Result<u8> {
    let names = StageRegistry::new(config).list_stages()?;
    match format {
        OutputFormat::Text => {
            for name in &names {
                println!("{name}");
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&names)?),
    }
    Ok(0)
}

fn cmd_show(config: &RuntimeConfig, name: &str, format: OutputFormat) -> Result<u8> {
    let stage = StageRegistry::new(config).load_stage(name)?;
    let resolver = Resolver::new(config);
    match format {
        OutputFormat::Text => print!("{}", render_stage(&stage, &resolver)?),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&stage_json(&stage, &resolver)?)?
        ),
    }
    Ok(0)
}

const REDACTED: &str = "[REDACTED]";

fn render_stage(stage: &Stage, resolver: &Resolver) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "stage {}", stage.name())?;
    writeln!(out, "digest {}", stage.digest())?;

    writeln!(out, "roles:")?;
    for role in stage.roles() {
        writeln!(out, "  {}: {}", role.name, role.hosts.join(", "))?;
    }

    writeln!(out, "hosts:")?;
    for target in resolver.resolve_targets(stage, &[])? {
        writeln!(
            out,
            "  {} [{}] auth {}",
            target,
            target.roles.join(","),
            target.endpoint.auth
        )?;
    }

    writeln!(out, "options:")?;
    for (option, value) in stage.options().known() {
        writeln!(out, "  {} = {}", option.key(), value)?;
    }
    for key in stage.options().secret_keys() {
        writeln!(out, "  {key} = {REDACTED}")?;
    }

    writeln!(out, "steps:")?;
    for step in stage.steps() {
        let roles = if step.roles.is_empty() {
            "all".to_string()
        } else {
            step.roles.join(",")
        };
        writeln!(out, "  {} [{}]: {}", step.name, roles, step.command)?;
    }
    Ok(out)
}

fn stage_json(stage: &Stage, resolver: &Resolver) -> Result<serde_json::Value> {
    let hosts: Vec<_> = resolver
        .resolve_targets(stage, &[])?
        .iter()
        .map(|t| {
            json!({
                "host": t.host(),
                "endpoint": t.to_string(),
                "roles": t.roles,
                "auth": t.endpoint.auth.kind(),
            })
        })
        .collect();

    let mut options = serde_json::Map::new();
    for (option, value) in stage.options().known() {
        options.insert(option.key().to_string(), json!(value.to_string()));
    }
    for key in stage.options().secret_keys() {
        options.insert(key.to_string(), json!(REDACTED));
    }

    let steps: Vec<_> = stage
        .steps()
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "command": s.command,
                "roles": s.roles,
                "success_codes": s.success_codes,
                "timeout_secs": s.timeout.map(|t| t.as_secs()),
                "within_deploy_to": s.within_deploy_to,
            })
        })
        .collect();

    Ok(json!({
        "stage": stage.name(),
        "digest": stage.digest(),
        "roles": stage
            .roles()
            .iter()
            .map(|r| json!({ "name": r.name, "hosts": r.hosts }))
            .collect::<Vec<_>>(),
        "hosts": hosts,
        "options": options,
        "steps": steps,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_stage::StageDefinition;
    use std::path::Path;

    const STAGE: &str = r#"
[roles]
www = ["deployer@vpn.framsteg.de"]

[[server]]
address = "db1"
roles = ["db"]
password_secret = "db_password"

[ssh_options]
port = 7047

[set]
deploy_to = "/var/www/pricewars-merchant2"
db_password = "hunter2"

[[step]]
name = "check"
command = "test -d {deploy_to}"
"#;

    fn stage() -> Stage {
        let def = StageDefinition::from_toml(STAGE).unwrap();
        Stage::from_definition("production2", def, Path::new("/nonexistent")).unwrap()
    }

    #[test]
    fn test_deploy_args_parse() {
        let cli = Cli::try_parse_from([
            "berth",
            "deploy",
            "production2",
            "--steps",
            "check,restart",
            "--strategy",
            "rolling",
            "--batch-size",
            "2",
            "--report",
            "json",
        ])
        .unwrap();

        match cli.command {
            Commands::Deploy {
                run,
                dry_run,
                report,
            } => {
                assert_eq!(run.stage, "production2");
                assert_eq!(run.steps, vec!["check", "restart"]);
                assert_eq!(run.strategy, Some(Strategy::Rolling));
                assert_eq!(run.batch_size, Some(2));
                assert!(!dry_run);
                assert_eq!(report, OutputFormat::Json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = Cli::try_parse_from(["berth", "plan", "staging", "--strategy", "canary"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["berth", "stages", "-vv", "--json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
    }

    #[test]
    fn test_missing_strategy_is_a_config_error() {
        let run = RunArgs {
            stage: "staging".to_string(),
            steps: Vec::new(),
            strategy: None,
            batch_size: None,
            max_parallel: None,
        };
        let err = anyhow::Error::from(run.strategy().unwrap_err());
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let run = RunArgs {
            stage: "staging".to_string(),
            steps: Vec::new(),
            strategy: Some(Strategy::Rolling),
            batch_size: Some(0),
            max_parallel: None,
        };
        assert!(run.apply(RuntimeConfig::default()).is_err());
    }

    #[test]
    fn test_exit_codes_for_errors() {
        let resolution: anyhow::Error = DeployError::Resolution(ResolutionError::NoSteps {
            stage: "staging".to_string(),
        })
        .into();
        assert_eq!(exit_code_for(&resolution), EXIT_CONFIG);

        let wrapped = anyhow::Error::from(ConfigError::UnknownStep("migrate".to_string()))
            .context("loading stage 'staging'");
        assert_eq!(exit_code_for(&wrapped), EXIT_CONFIG);

        let worker: anyhow::Error = DeployError::Worker {
            host: "web1".to_string(),
            reason: "panicked".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&worker), 2);
    }

    #[test]
    fn test_show_redacts_secrets() {
        let stage = stage();
        let resolver = Resolver::new(&RuntimeConfig::default());

        let text = render_stage(&stage, &resolver).unwrap();
        assert!(text.contains("deployer@vpn.framsteg.de:7047"));
        assert!(text.contains("db_password = [REDACTED]"));
        assert!(text.contains("auth password"));
        assert!(!text.contains("hunter2"));

        let value = stage_json(&stage, &resolver).unwrap();
        assert_eq!(value["options"]["db_password"], REDACTED);
        assert!(!value.to_string().contains("hunter2"));
    }
}

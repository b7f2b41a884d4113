mod config;
mod coordinator;
mod executor;
mod line_processor;
mod process;
mod protocol;
mod reachability;
mod registration;
mod runtime;
mod session;
mod sink;
mod task_set;
#[cfg(test)]
mod test_support;
mod tls;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, INFO_PATH};
use executor::{ExecutorDescriptor, ExecutorRegistry};
use reachability::ReachabilityChecker;
use registration::RegistrationError;
use serde_json::json;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Agent that runs scanning executors on behalf of a remote server"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "DISPATCHER_RS_CONFIG",
        default_value = "dispatcher-rs.toml"
    )]
    config: PathBuf,

    /// One-time registration token (25 digits) used when no agent token is stored.
    #[arg(long, global = true, env = "DISPATCHER_RS_REGISTRATION_TOKEN")]
    token: Option<String>,

    /// Override server host.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Override agent name.
    #[arg(long = "agent-name", global = true)]
    agent_name: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "DISPATCHER_RS_LOG", default_value = "info")]
    log: String,

    /// Also write logs to <dir>/dispatcher.log.
    #[arg(long = "log-dir", global = true, env = "DISPATCHER_RS_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Force debug logging with targets.
    #[arg(long, global = true, env = "DISPATCHER_RS_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Register, join the server and run executors until stopped.
    Run,
    /// Probe the server api and exit 0 when it answers.
    Check,
    /// List configured executors and their parameters.
    Executors(ExecutorsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct ExecutorsArgs {
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match init_logging(&cli.log, cli.log_dir.as_deref(), cli.debug) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed initializing logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    tls::install_crypto_provider();

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    let outcome = match command {
        CliCommand::Run => run_agent(cli).await,
        CliCommand::Check => run_check(&cli).await,
        CliCommand::Executors(args) => run_executors_command(&cli, args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<RegistrationError>()
                .map(RegistrationError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.host.as_deref(), cli.agent_name.as_deref());
    Ok(cfg)
}

async fn run_agent(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli)?;
    let runtime = runtime::AgentRuntime::new(cfg, cli.config.clone(), cli.token.clone())?;
    runtime.run().await
}

async fn run_check(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let http = tls::build_http_client(&cfg.server)?;
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let checker = ReachabilityChecker::new(
        http,
        cfg.server.api_url(INFO_PATH),
        Duration::from_secs(cfg.server.http_timeout_secs),
        cancel_rx,
    );
    if checker.check_connection().await {
        println!("server reachable at {}", checker.info_url());
        Ok(())
    } else {
        anyhow::bail!("server unreachable at {}", checker.info_url())
    }
}

fn run_executors_command(cli: &Cli, args: ExecutorsArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let registry = ExecutorRegistry::from_config(&cfg)?;
    if args.json {
        let listing = registry.iter().map(executor_json).collect::<Vec<_>>();
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).context("failed encoding executor list")?
        );
        return Ok(());
    }
    if registry.is_empty() {
        println!("no executors configured in {}", cli.config.display());
        return Ok(());
    }
    for descriptor in registry.iter() {
        println!("{}", describe_executor(descriptor));
    }
    Ok(())
}

fn executor_json(descriptor: &ExecutorDescriptor) -> serde_json::Value {
    json!({
        "executor_name": descriptor.name(),
        "command": descriptor.command(),
        "repo_executor": descriptor.is_repo_sourced(),
        "max_size": descriptor.max_size(),
        "check_cmds": descriptor.check_cmds(),
        "args": descriptor.params(),
        "varenvs": descriptor.varenvs().keys().collect::<Vec<_>>(),
    })
}

fn describe_executor(descriptor: &ExecutorDescriptor) -> String {
    let params = descriptor
        .params()
        .iter()
        .map(|(name, spec)| {
            let kind = serde_json::to_value(spec.kind)
                .ok()
                .and_then(|value| value.as_str().map(str::to_owned))
                .unwrap_or_default();
            if spec.mandatory {
                format!("{name}*:{kind}")
            } else {
                format!("{name}:{kind}")
            }
        })
        .collect::<Vec<_>>();
    format!(
        "{} max_size={} params=[{}] command={}",
        descriptor.name(),
        descriptor.max_size(),
        params.join(", "),
        descriptor.command()
    )
}

fn init_logging(filter: &str, log_dir: Option<&Path>, debug: bool) -> Result<Option<WorkerGuard>> {
    let filter = if debug { "debug" } else { filter };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "dispatcher.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env)
                .with_target(debug)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env)
                .with_target(debug)
                .init();
            Ok(None)
        }
    }
}

//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use signal_hook::consts::{SIGINT, SIGTERM};
use thiserror::Error;

use container_ballast_helper::core::config::Config;
use container_ballast_helper::core::errors::CbhError;
use container_ballast_helper::lifecycle::{ContainerLifecycle, ContainerStatus, StopReport};
use container_ballast_helper::logger::ActivityLog;
use container_ballast_helper::logger::jsonl::JsonlConfig;
use container_ballast_helper::runtime::CancelToken;
use container_ballast_helper::runtime::docker::DockerCli;

/// Container Ballast Helper: keeps quota-limited containers restartable.
#[derive(Debug, Parser)]
#[command(
    name = "cbh",
    author,
    version,
    about = "Container Ballast Helper - quota headroom for restartable containers",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Create and start a container with a ballast file.
    Run(ContainerArgs),
    /// Stop a container, shrinking its ballast first if headroom is low.
    Stop(ContainerArgs),
    /// Start a stopped container.
    Start(ContainerArgs),
    /// Force-remove a container (succeeds if it is already gone).
    Remove(ContainerArgs),
    /// Show threshold, usage and ballast size for a container.
    Status(ContainerArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct ContainerArgs {
    /// Container name.
    #[arg(default_value = "test")]
    name: String,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Container runtime or environment failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<CbhError> for CliError {
    fn from(err: CbhError) -> Self {
        match err {
            CbhError::InvalidConfig { .. }
            | CbhError::MissingConfig { .. }
            | CbhError::ConfigParse { .. }
            | CbhError::NotFound { .. } => Self::User(err.to_string()),
            CbhError::Serialization { .. } => Self::Internal(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_container(cli, args),
        Command::Stop(args) => stop_container(cli, args),
        Command::Start(args) => start_container(cli, args),
        Command::Remove(args) => remove_container(cli, args),
        Command::Status(args) => show_status(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── container commands ────────────────────

/// Load config, connect to the daemon and wire SIGINT/SIGTERM to cancellation.
fn open_lifecycle(cli: &Cli) -> Result<ContainerLifecycle<DockerCli>, CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let cancel = CancelToken::new();
    for signal in [SIGINT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, cancel.flag()) {
            eprintln!("[CBH-SIGNAL] failed to register handler for signal {signal}: {e}");
        }
    }

    let runtime = DockerCli::connect_with_cancel(&config.runtime, cancel.clone())?;
    let log = ActivityLog::open(JsonlConfig::at(&config.paths.jsonl_log), !cli.quiet);
    if cli.verbose {
        eprintln!(
            "[CBH] config {} (hash {}), runtime {}",
            config.paths.config_file.display(),
            config.stable_hash()?,
            config.runtime.binary
        );
    }

    Ok(ContainerLifecycle::new(runtime, &config)
        .with_log(log)
        .with_cancel(cancel))
}

/// Close the lifecycle, keeping the operation's own error if both fail.
fn finish<T>(
    lifecycle: ContainerLifecycle<DockerCli>,
    outcome: Result<T, CliError>,
) -> Result<T, CliError> {
    let closed = lifecycle.close();
    let value = outcome?;
    closed?;
    Ok(value)
}

fn run_container(cli: &Cli, args: &ContainerArgs) -> Result<(), CliError> {
    let lifecycle = open_lifecycle(cli)?;
    let threshold = lifecycle.threshold();
    let margin = lifecycle.policy().margin;
    let outcome = lifecycle.run(&args.name).map_err(CliError::from);
    let id = finish(lifecycle, outcome)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!(
                    "{} {} ({})",
                    "Started".green(),
                    args.name.bold(),
                    short_id(&id)
                );
                println!("  Threshold: {threshold}");
                println!("  Ballast:   {margin}");
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "run",
                "name": args.name,
                "id": id,
                "threshold": threshold.to_string(),
                "ballast_bytes": margin.bytes(),
            }))?;
        }
    }
    Ok(())
}

fn stop_container(cli: &Cli, args: &ContainerArgs) -> Result<(), CliError> {
    let lifecycle = open_lifecycle(cli)?;
    let outcome = lifecycle.stop(&args.name).map_err(CliError::from);
    let report = finish(lifecycle, outcome)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                print_stop_report(&args.name, &report, cli.verbose);
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "stop",
                "name": args.name,
                "report": serde_json::to_value(&report)?,
            }))?;
        }
    }
    Ok(())
}

fn print_stop_report(name: &str, report: &StopReport, verbose: bool) {
    println!("{} {}", "Stopped".green(), name.bold());
    if !report.managed {
        if verbose {
            println!("  Not under ballast management.");
        }
        return;
    }
    if let Some(headroom) = report.headroom_gb {
        println!("  Headroom: {headroom}GB");
    }
    match &report.adjustment {
        Some(adj) => println!(
            "  Ballast:  {} -> {} (released {})",
            adj.previous,
            adj.current,
            adj.released()
        ),
        None if verbose => println!("  Ballast:  unchanged"),
        None => {}
    }
    if let Some(err) = &report.diagnostic_error {
        println!("  {} {err}", "Skipped adjustment:".yellow());
    }
}

fn start_container(cli: &Cli, args: &ContainerArgs) -> Result<(), CliError> {
    let lifecycle = open_lifecycle(cli)?;
    let outcome = lifecycle.start(&args.name).map_err(CliError::from);
    finish(lifecycle, outcome)?;
    emit_simple(cli, "start", "Started", &args.name)
}

fn remove_container(cli: &Cli, args: &ContainerArgs) -> Result<(), CliError> {
    let lifecycle = open_lifecycle(cli)?;
    let outcome = lifecycle.remove(&args.name).map_err(CliError::from);
    finish(lifecycle, outcome)?;
    emit_simple(cli, "remove", "Removed", &args.name)
}

fn emit_simple(cli: &Cli, command: &str, verb: &str, name: &str) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!("{} {}", verb.green(), name.bold());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({ "command": command, "name": name, "ok": true }))?;
        }
    }
    Ok(())
}

fn show_status(cli: &Cli, args: &ContainerArgs) -> Result<(), CliError> {
    let lifecycle = open_lifecycle(cli)?;
    let outcome = lifecycle.status(&args.name).map_err(CliError::from);
    let status = finish(lifecycle, outcome)?;

    match output_mode(cli) {
        OutputMode::Human => print_status(&status),
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "status",
                "status": serde_json::to_value(&status)?,
            }))?;
        }
    }
    Ok(())
}

fn print_status(status: &ContainerStatus) {
    let state = if status.running {
        "running".green()
    } else {
        "stopped".yellow()
    };
    println!("{} ({}) {state}", status.name.bold(), short_id(&status.id));
    if !status.managed {
        println!("  Not under ballast management.");
        return;
    }
    println!("  Threshold: {}", or_unknown(status.threshold.map(|t| t.to_string())));
    println!("  Used:      {}", or_unknown(status.used_gb.map(|u| format!("{u}GB"))));
    println!("  Headroom:  {}", or_unknown(status.headroom_gb.map(|h| format!("{h}GB"))));
    println!("  Ballast:   {}", or_unknown(status.ballast.map(|b| b.to_string())));
}

fn or_unknown(value: Option<String>) -> String {
    value.unwrap_or_else(|| "unknown".to_string())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "error_code": e.code(),
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CBH_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

//! fanout CLI
//!
//! Runs one action against targets from a config file and prints the
//! results as JSON on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, eyre};
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use fanout_core::{ActionOptions, Event, Executor, InputMethod, ResultSet, TaskFile, TaskSpec};
use fanout_exec::Target;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Run commands, scripts, tasks and file transfers on many targets", long_about = None)]
struct Cli {
    /// Config file with executor settings and targets
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Targets to run on, comma separated; every configured target by default
    #[arg(short, long, global = true, value_delimiter = ',')]
    targets: Vec<String>,

    /// Maximum number of targets running at once, 0 for no limit
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// User to run the action as
    #[arg(long, global = true)]
    run_as: Option<String>,

    /// Environment variable for commands and scripts, as KEY=VALUE
    #[arg(short, long = "env", global = true, value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Exit successfully even when targets failed
    #[arg(long, global = true)]
    catch_errors: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command
    Command { command: String },

    /// Upload a local script and run it
    Script {
        path: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// Run a task executable with JSON parameters
    Task {
        /// Qualified task name, `module::task`
        name: String,
        /// Local path of the task executable
        executable: PathBuf,
        /// Parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,
        /// How parameters reach the task: stdin, environment, both or powershell
        #[arg(long, value_parser = parse_input_method)]
        input_method: Option<InputMethod>,
        /// Support file as NAME=PATH, NAME relative to the module root
        #[arg(long = "file", value_parser = parse_key_value)]
        files: Vec<(String, String)>,
    },

    /// Copy a local file or directory to the targets
    Upload { source: PathBuf, destination: String },

    /// Copy a remote file or directory from the targets into DESTINATION/<target>/
    Download { source: String, destination: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let path = Config::locate(cli.config.as_deref());
    let mut config = match &path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_tracing(&config.executor.log_level, cli.json_logs);
    match &path {
        Some(path) => debug!(path = %path.display(), "loaded config"),
        None => warn!("no config file found, using defaults"),
    }

    if let Some(concurrency) = cli.concurrency {
        config.executor.concurrency = concurrency;
    }
    let targets = config.select(&cli.targets)?;

    let (tx, rx) = broadcast::channel::<Event>(256);
    tokio::spawn(log_events(rx));
    let executor = Arc::new(Executor::new(config.executor).with_sink(Arc::new(tx)));

    let interrupted = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remaining targets");
            interrupted.shutdown();
        }
    });

    let options = ActionOptions {
        env: cli.env.into_iter().collect(),
        run_as: cli.run_as,
        catch_errors: cli.catch_errors,
    };
    let catch_errors = options.catch_errors;
    let results = run(&executor, &targets, cli.command, options).await?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    match results.into_result(catch_errors) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(failure) => {
            warn!("{failure}");
            Ok(ExitCode::from(2))
        }
    }
}

fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(
    executor: &Executor,
    targets: &[Target],
    command: Commands,
    options: ActionOptions,
) -> Result<ResultSet> {
    let results = match command {
        Commands::Command { command } => executor.run_command(targets, command, options).await?,
        Commands::Script { path, arguments } => {
            executor.run_script(targets, path, arguments, options).await?
        }
        Commands::Task {
            name,
            executable,
            params,
            input_method,
            files,
        } => {
            let arguments = parse_params(&params)?;
            let mut task = TaskSpec::new(name, executable);
            task.input_method = input_method;
            task.files = files
                .into_iter()
                .map(|(name, path)| TaskFile {
                    name,
                    path: PathBuf::from(path),
                })
                .collect();
            executor.run_task(targets, task, arguments, options).await?
        }
        Commands::Upload {
            source,
            destination,
        } => executor.upload_file(targets, source, destination, options).await?,
        Commands::Download {
            source,
            destination,
        } => executor.download_file(targets, source, destination, options).await?,
    };
    Ok(results)
}

async fn log_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(event = %json, "event"),
                Err(e) => warn!(error = %e, "unserializable event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_input_method(s: &str) -> Result<InputMethod, String> {
    serde_json::from_value(Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown input method '{s}'"))
}

fn parse_params(params: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(params).wrap_err("task parameters are not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => Err(eyre!("task parameters must be a JSON object, got {other}")),
    }
}

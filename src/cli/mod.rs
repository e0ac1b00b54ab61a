//! Command-line surface of the `sandbox-stream` binary

use crate::config::{BackendConfig, ConfigLoader, SessionConfig};
use crate::execution::{CommandResult, DecodePolicy, StreamCallback};
use crate::session::SandboxSession;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Run commands inside container sandboxes and stream their output
#[derive(Debug, Parser)]
#[command(name = "sandbox-stream", version)]
#[command(about = "Run commands inside container sandboxes and stream their output", long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one or more commands in order
    Run(RunArgs),
    /// Print the effective configuration as TOML
    Config {
        /// Path to configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Backend to exec through (local, docker, podman, kubernetes)
    #[arg(short = 'b', long)]
    pub backend: Option<String>,

    /// Container or pod to run in
    #[arg(long)]
    pub container: Option<String>,

    /// Stream output even when it is not echoed
    #[arg(long)]
    pub stream: bool,

    /// How undecodable output is handled (strict, replace, ignore)
    #[arg(long)]
    pub encoding_errors: Option<DecodePolicy>,

    /// Per-command timeout, e.g. 30s or 2m
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Stop after the first command that exits non-zero
    #[arg(long)]
    pub stop_on_error: bool,

    /// Print results as JSON instead of echoing output live
    #[arg(long)]
    pub json: bool,

    /// Working directory for the commands
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Commands to run; each argument is one shell command
    #[arg(required = true, num_args = 1.., last = true)]
    pub commands: Vec<String>,
}

impl RunArgs {
    /// Overlay command-line flags on the loaded configuration
    pub fn apply(&self, config: &mut SessionConfig) -> Result<()> {
        if let Some(backend) = &self.backend {
            let selected = BackendConfig::from_name(backend)?;
            if selected.kind() != config.backend.kind() {
                config.backend = selected;
            }
        }
        if let Some(container) = &self.container {
            config.container = Some(container.clone());
        }
        if self.stream {
            config.stream = true;
        }
        if let Some(policy) = self.encoding_errors {
            config.encoding_errors = policy;
        }
        if let Some(timeout) = self.timeout {
            config.execution_timeout = Some(timeout);
        }
        if self.stop_on_error {
            config.stop_on_error = true;
        }
        if let Some(workdir) = &self.workdir {
            config.workdir = Some(workdir.clone());
        }
        Ok(())
    }
}

async fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    let loader = ConfigLoader::new();
    loader
        .load(path.map(PathBuf::as_path))
        .await
        .context("Failed to load configuration")?;
    Ok(loader.get_config())
}

fn echo_to_stdout() -> StreamCallback {
    StreamCallback::fallible(|chunk| {
        let mut out = std::io::stdout().lock();
        out.write_all(chunk.as_bytes())?;
        out.flush()?;
        Ok(())
    })
}

fn echo_to_stderr() -> StreamCallback {
    StreamCallback::fallible(|chunk| {
        let mut err = std::io::stderr().lock();
        err.write_all(chunk.as_bytes())?;
        err.flush()?;
        Ok(())
    })
}

/// Run the batch and return the process exit code
pub async fn run(args: RunArgs) -> Result<i32> {
    let mut config = load_config(args.config.as_ref()).await?;
    args.apply(&mut config)?;
    tracing::debug!(?config, "Effective configuration");

    let session = SandboxSession::builder()
        .config(config)
        .build()
        .await
        .context("Failed to start session")?;

    let (on_stdout, on_stderr) = if args.json {
        (None, None)
    } else {
        (Some(echo_to_stdout()), Some(echo_to_stderr()))
    };

    let results: Vec<CommandResult> = session
        .run(args.commands.iter().map(String::as_str), on_stdout, on_stderr)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }

    Ok(results.last().map(|result| result.exit_code).unwrap_or(0))
}

/// Print the effective configuration
pub async fn show_config(path: Option<PathBuf>) -> Result<i32> {
    let config = load_config(path.as_ref()).await?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(0)
}

//! histsync: move historian tag exports into the durable store.
//!
//! Meant to be started by an external scheduler; each invocation of `run`
//! performs exactly one pipeline run and exits with a status that tells the
//! scheduler what happened.

use clap::{Parser, Subcommand};
use histsync::{Config, ConfigError};
use histsync_logging::{init_logging, init_stderr_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::error::HelpfulError;
use cli::exit::ExitStatus;

#[derive(Parser, Debug)]
#[command(name = "histsync", version, about = "Incremental historian tag sync")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $HISTSYNC_CONFIG, then <home>/config.toml)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, merge, and load once, now
    Run(cli::run::RunArgs),

    /// Show lock state and cached tags
    Status(cli::status::StatusArgs),

    /// Show the resolved configuration
    Config(cli::config::ConfigArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, source) = match Config::resolve(cli.config.as_deref()) {
        Ok(resolved) => resolved,
        Err(err) => return startup_failure(&err),
    };
    if let Commands::Run(args) = &cli.command {
        args.apply(&mut config);
    }
    if let Err(err) = config.validate() {
        return startup_failure(&err);
    }

    let result = match &cli.command {
        Commands::Run(args) => {
            if let Err(err) = config.remote_dir() {
                return startup_failure(&err);
            }
            if let Err(err) =
                init_logging(LogConfig::new("histsync", config.log_dir.clone()).verbose(cli.verbose))
            {
                eprintln!("Warning: file logging unavailable, logging to stderr only: {:#}", err);
                if let Err(err) = init_stderr_logging(cli.verbose) {
                    eprintln!("Warning: {:#}", err);
                }
            }
            cli::run::run(args, &config)
        }
        Commands::Status(args) => {
            cli::status::run(args, &config, source.as_deref()).map(|()| ExitStatus::Success)
        }
        Commands::Config(args) => {
            cli::config::run(args, &config, source.as_deref()).map(|()| ExitStatus::Success)
        }
    };

    match result {
        Ok(status) => status.into(),
        Err(err) => {
            eprintln!("ERROR: {:#}", err);
            ExitStatus::Fatal.into()
        }
    }
}

fn startup_failure(err: &ConfigError) -> ExitCode {
    eprint!("{}", HelpfulError::from_config(err));
    ExitStatus::Fatal.into()
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gavel::config::GavelConfig;
use gavel::errors::ExitStatus;
use gavel::stages::SourceScope;

mod cmd;

#[derive(Parser)]
#[command(name = "gavel")]
#[command(version, about = "Resumable batch pipeline for hearing video transcripts")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to gavel.toml. Relative paths inside it resolve against its directory.
    #[arg(long, global = true, default_value = "gavel.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one batch: discover, process and upload
    Run {
        /// Source to process: `all` or one source name (e.g. house, senate)
        #[arg(short, long, default_value = "all")]
        source: SourceScope,

        /// Run every stage without updating the pipeline store
        #[arg(long)]
        dry_run: bool,
    },
    /// Show item counts per state
    Status,
    /// Print one item record as JSON
    Show { id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

fn load_config(path: &Path) -> Result<GavelConfig> {
    let mut config = GavelConfig::load_or_default(path)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_paths(&base);
    Ok(config)
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let _log_guard = gavel::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Run { source, dry_run } => cmd::cmd_run(&config, source.clone(), *dry_run).await,
        Commands::Status => cmd::cmd_status(&config),
        Commands::Show { id } => cmd::cmd_show(&config, id),
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Stage commands inherit credentials from .env.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match dispatch(&cli).await {
        Ok(()) => ExitStatus::Success.into(),
        Err(e) => {
            let status = ExitStatus::from_error(&e);
            if status == ExitStatus::AlreadyRunning {
                eprintln!("{} {}", style("busy:").yellow().bold(), e);
            } else {
                eprintln!("{} {:#}", style("error:").red().bold(), e);
            }
            status.into()
        }
    }
}

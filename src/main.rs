//! a11y-triage - accessibility finding triage and patch verification
//!
//! Runs detector agents over a directory of UI artifacts, clusters what they
//! find by root cause, and verifies proposed patches in a sandbox copy.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use a11y_triage::cli::{self, Cli, Commands};
use a11y_triage::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load_from(&config_path)?
    } else {
        Config::default()
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(format!("a11y_triage={level}").parse()?))
        .init();

    match cli.command {
        Commands::Plan(args) => cli::run_plan(config, &args, cli.json).await?,
        Commands::Run(args) => cli::run_evaluate(config, &args, cli.json).await?,
        Commands::Cluster(args) => cli::run_cluster(config, &args, cli.json).await?,
        Commands::Verify(args) => cli::run_verify(config, &args, cli.json).await?,
        Commands::Config(args) => cli::run_config(&config, &args, &config_path)?,
    }

    Ok(())
}

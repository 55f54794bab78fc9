//! CLI module - Command line interface definitions and handlers

mod commands;
mod progress;

pub use commands::{run_cluster, run_config, run_evaluate, run_plan, run_verify};
pub use progress::ProgressRenderer;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::cluster::ClusteringMethod;
use crate::sandbox::RecheckScope;

/// a11y-triage - accessibility finding aggregation and fix verification
///
/// Runs detectors over a directory of UI artifacts, groups the findings by
/// root cause, and checks proposed patches in a sandbox copy. The artifact
/// directory is never written to.
#[derive(Parser, Debug)]
#[command(name = "a11y-triage")]
#[command(version)]
#[command(about = "Accessibility finding triage and patch verification", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose logging (debug level)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the agent plan for an artifact directory
    Plan(SourceArgs),

    /// Run every applicable agent and print the findings
    Run(RunArgs),

    /// Run agents and cluster the findings
    Cluster(ClusterArgs),

    /// Apply patches in a sandbox and recheck
    Verify(VerifyArgs),

    /// Print or write the configuration
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// Directory holding the uploaded artifacts
    #[arg(required = true)]
    pub source: PathBuf,

    /// Upload id (default: directory name)
    #[arg(long)]
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Per-agent timeout in seconds (overrides config)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Concurrent agents (overrides config)
    #[arg(long, short)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Args)]
pub struct ClusterArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, value_enum)]
    pub method: Option<MethodArg>,

    /// Similarity threshold within [0, 1]
    #[arg(long)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// JSON file with the patches to apply
    #[arg(long, short, required = true)]
    pub patches: PathBuf,

    #[arg(long, value_enum, default_value = "full")]
    pub scope: ScopeArg,

    /// Leave the sandbox directory in place afterwards
    #[arg(long)]
    pub keep_sandbox: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Print a commented sample instead of the effective config
    #[arg(long)]
    pub sample: bool,

    /// Write the effective config to the config path
    #[arg(long, conflicts_with = "sample")]
    pub write: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MethodArg {
    RuleBased,
    Semantic,
    Hybrid,
}

impl From<MethodArg> for ClusteringMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::RuleBased => ClusteringMethod::RuleBased,
            MethodArg::Semantic => ClusteringMethod::Semantic,
            MethodArg::Hybrid => ClusteringMethod::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScopeArg {
    Full,
    Touched,
}

impl From<ScopeArg> for RecheckScope {
    fn from(s: ScopeArg) -> Self {
        match s {
            ScopeArg::Full => RecheckScope::Full,
            ScopeArg::Touched => RecheckScope::Touched,
        }
    }
}

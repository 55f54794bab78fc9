//! a11y-triage Library
//!
//! Accessibility finding aggregation and remediation verification:
//! detector agents run over a read-only artifact manifest, their findings
//! are grouped into root-cause clusters, and externally proposed patches are
//! verified in a sandbox copy before anyone trusts them.
//!
//! # Features
//!
//! - **Dependency-aware scheduling**: agents run in parallel groups derived
//!   from their declared dependencies
//! - **Bounded execution**: per-agent and per-plan timeouts; one failing
//!   agent never takes the run down
//! - **Deterministic clustering**: rule-based, semantic (connected
//!   components) or hybrid, independent of input order
//! - **Read-only originals**: sandboxes are copies, guarded writes and
//!   blake3 checksums prove the originals were never touched
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use a11y_triage::{Config, Evaluator, Manifest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manifest = Arc::new(Manifest::scan("upload-1", "./site")?);
//!     let evaluator = Evaluator::new(Config::default());
//!
//!     let evaluation = evaluator.evaluate(manifest).await?;
//!     println!("{}", evaluation.clustering.to_human_string());
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod plan;
pub mod readonly;
pub mod runtime;
pub mod sandbox;
pub mod synth;

// Re-export commonly used types
pub use agents::{AgentContext, AgentDescriptor, AgentOutput, AgentRegistry, DetectorAgent};
pub use cluster::{
    cluster_findings, Cluster, ClusterKey, ClusterStatus, ClusterStore, ClusterUpdate, ClusteringMethod,
    ClusteringResult, OccurrenceDisposition, Priority, SplitCriteria,
};
pub use config::Config;
pub use crate::core::{ArtifactKind, Confidence, Criterion, Evidence, Finding, Manifest, ManifestEntry, Severity};
pub use engine::{Evaluation, Evaluator, Verification};
pub use error::{Error, Result};
pub use plan::{build_plan, build_plan_for_criteria, AgentPlan};
pub use readonly::{checksum_file, open_readonly, safe_copy, ChecksumLedger, WriteGuard};
pub use runtime::{AgentResult, AgentRuntime, ProgressEvent, RunOutcome, RuntimeConfig};
pub use sandbox::{
    compare, Patch, PatchApplicationError, PatchBatch, PatchOutcome, PatchSummary, PatchType, RecheckResult,
    RecheckScope, Sandbox, SandboxManager,
};
pub use synth::{ClusterDigest, JsonPatchFile, PatchSynthesizer};

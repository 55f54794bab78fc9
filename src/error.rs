//! Error taxonomy
//!
//! Structural failures (planning, unknown identity, missing sandbox) surface
//! as [`Error`]. Per-agent and per-patch failures never abort sibling work;
//! they are recorded as partial results ([`crate::runtime::AgentResult`],
//! [`crate::sandbox::PatchOutcome`]).

use std::path::PathBuf;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("planning failed: no registered agent is applicable to upload `{upload_id}`")]
    NoEligibleAgents { upload_id: String },

    #[error("planning failed: dependency cycle between agents [{}]", agents.join(", "))]
    CyclicDependency { agents: Vec<String> },

    #[error("planning failed: agent `{agent}` depends on unregistered agent `{dependency}`")]
    UnknownDependency { agent: String, dependency: String },

    #[error("all {} agents failed: {}", failures.len(), format_failures(failures))]
    AllAgentsFailed { failures: Vec<(String, String)> },

    #[error("cluster `{id}` not found")]
    ClusterNotFound { id: String },

    #[error("no active sandbox for upload `{upload_id}`")]
    SandboxNotFound { upload_id: String },

    #[error("similarity threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the planning variants (no eligible agent, cycle, unknown dependency)
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Error::NoEligibleAgents { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
        )
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(agent, err)| format!("{agent}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

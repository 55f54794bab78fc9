use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{diff, validate};
use crate::core::{Confidence, Criterion};
use crate::readonly::WriteGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchType {
    CssUpdate,
    HtmlUpdate,
    AttributeAdd,
    AttributeRemove,
    ContentUpdate,
}

impl PatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchType::CssUpdate => "css_update",
            PatchType::HtmlUpdate => "html_update",
            PatchType::AttributeAdd => "attribute_add",
            PatchType::AttributeRemove => "attribute_remove",
            PatchType::ContentUpdate => "content_update",
        }
    }
}

impl std::fmt::Display for PatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the new file content is described
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "body", rename_all = "snake_case")]
pub enum PatchPayload {
    /// `---`/`+++`/`@@` text, context lines verified on apply
    UnifiedDiff(String),
    /// Literal full-content replacement
    Replace(String),
}

impl PatchPayload {
    fn body(&self) -> &str {
        match self {
            PatchPayload::UnifiedDiff(s) | PatchPayload::Replace(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchSafety {
    Safe,
    Risky,
}

/// A proposed change to one artifact file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
    /// Relative to the artifact root
    pub target: String,
    pub payload: PatchPayload,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion: Option<Criterion>,
}

impl Patch {
    /// Full-content replacement of `target`
    pub fn new(patch_type: PatchType, target: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_payload(patch_type, target.into(), PatchPayload::Replace(content.into()))
    }

    pub fn unified_diff(patch_type: PatchType, target: impl Into<String>, diff: impl Into<String>) -> Self {
        Self::with_payload(patch_type, target.into(), PatchPayload::UnifiedDiff(diff.into()))
    }

    fn with_payload(patch_type: PatchType, target: String, payload: PatchPayload) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in [patch_type.as_str(), target.as_str(), payload.body()] {
            hasher.update(part.as_bytes());
            hasher.update(&[0x1f]);
        }
        Self {
            id: format!("patch_{}", &hasher.finalize().to_hex()[..16]),
            patch_type,
            target,
            payload,
            rationale: String::new(),
            risks: Vec::new(),
            confidence: Confidence::default(),
            cluster_id: None,
            criterion: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_risk(mut self, risk: impl Into<String>) -> Self {
        self.risks.push(risk.into());
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn for_cluster(mut self, cluster_id: impl Into<String>, criterion: Criterion) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self.criterion = Some(criterion);
        self
    }

    pub fn safety(&self) -> PatchSafety {
        if self.risks.is_empty() {
            PatchSafety::Safe
        } else {
            PatchSafety::Risky
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safety() == PatchSafety::Safe
    }

    /// Content after applying this patch to `original`
    pub fn render(&self, original: &str) -> Result<String, String> {
        match &self.payload {
            PatchPayload::Replace(content) => Ok(content.clone()),
            PatchPayload::UnifiedDiff(text) => diff::apply_unified_diff(original, text),
        }
    }
}

/// Per-patch failure; never aborts the rest of the batch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchApplicationError {
    #[error("target file `{path}` does not exist in the sandbox")]
    MissingTarget { path: String },

    #[error("target `{path}` resolves outside the sandbox")]
    OutsideSandbox { path: String },

    #[error("diff for `{path}` does not apply: {reason}")]
    DiffRejected { path: String, reason: String },

    #[error("`{path}` is no longer well-formed after patching: {reason}")]
    ValidationFailed { path: String, reason: String },

    #[error("io error on `{path}`: {message}")]
    Io { path: String, message: String },
}

/// Result of one patch in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub patch_id: String,
    pub target: String,
    pub safety: PatchSafety,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PatchApplicationError>,
}

impl PatchOutcome {
    fn applied(patch: &Patch) -> Self {
        Self {
            patch_id: patch.id.clone(),
            target: patch.target.clone(),
            safety: patch.safety(),
            applied: true,
            error: None,
        }
    }

    fn failed(patch: &Patch, error: PatchApplicationError) -> Self {
        Self {
            patch_id: patch.id.clone(),
            target: patch.target.clone(),
            safety: patch.safety(),
            applied: false,
            error: Some(error),
        }
    }
}

/// Batch counts: safe / risky over every patch, applied / failed over outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSummary {
    pub total: usize,
    pub safe: usize,
    pub risky: usize,
    pub applied: usize,
    pub failed: usize,
}

impl PatchSummary {
    pub fn of(outcomes: &[PatchOutcome]) -> Self {
        let safe = outcomes.iter().filter(|o| o.safety == PatchSafety::Safe).count();
        let applied = outcomes.iter().filter(|o| o.applied).count();
        Self {
            total: outcomes.len(),
            safe,
            risky: outcomes.len() - safe,
            applied,
            failed: outcomes.len() - applied,
        }
    }
}

/// Apply one patch inside the guard's workspace
pub(crate) fn apply_one(guard: &WriteGuard, patch: &Patch) -> PatchOutcome {
    match try_apply(guard, patch) {
        Ok(()) => {
            tracing::debug!("Applied {} to {}", patch.id, patch.target);
            PatchOutcome::applied(patch)
        }
        Err(e) => {
            tracing::warn!("Patch {} rejected: {}", patch.id, e);
            PatchOutcome::failed(patch, e)
        }
    }
}

fn try_apply(guard: &WriteGuard, patch: &Patch) -> Result<(), PatchApplicationError> {
    let target = guard
        .resolve(Path::new(&patch.target))
        .map_err(|_| PatchApplicationError::OutsideSandbox {
            path: patch.target.clone(),
        })?;
    if !target.is_file() {
        return Err(PatchApplicationError::MissingTarget {
            path: patch.target.clone(),
        });
    }

    let io_err = |path: &PathBuf, e: std::io::Error| PatchApplicationError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    };
    let original = std::fs::read_to_string(&target).map_err(|e| io_err(&target, e))?;

    let patched = patch
        .render(&original)
        .map_err(|reason| PatchApplicationError::DiffRejected {
            path: patch.target.clone(),
            reason,
        })?;
    validate::validate(patch.patch_type, &patched).map_err(|reason| PatchApplicationError::ValidationFailed {
        path: patch.target.clone(),
        reason,
    })?;

    guard.write(&target, patched.as_bytes()).map_err(|e| io_err(&target, e))
}

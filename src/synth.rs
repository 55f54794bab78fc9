//! Patch Synthesizer boundary
//!
//! Fix generation lives outside the core. The core hands each synthesizer a
//! [`ClusterDigest`] per cluster and takes back plain [`Patch`] records; no
//! synthesizer ever sees the sandbox or writes a file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::core::{Confidence, Criterion, Severity};
use crate::sandbox::{Patch, PatchPayload, PatchType};

/// What a synthesizer is told about one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDigest {
    pub cluster_id: String,
    pub criterion: Criterion,
    pub root_cause: String,
    pub key_components: Vec<String>,
    pub summary: String,
    pub severity: Severity,
    pub confidence: Confidence,
    pub wcag_criterion: String,
    pub selectors: Vec<String>,
    pub files: Vec<String>,
}

impl From<&Cluster> for ClusterDigest {
    fn from(cluster: &Cluster) -> Self {
        let selectors: BTreeSet<String> = cluster
            .occurrences()
            .iter()
            .map(|f| f.selector().to_string())
            .collect();
        Self {
            cluster_id: cluster.id().to_string(),
            criterion: cluster.criterion(),
            root_cause: cluster.root_cause().to_string(),
            key_components: cluster.key().components.clone(),
            summary: cluster.summary().to_string(),
            severity: cluster.severity(),
            confidence: cluster.confidence(),
            wcag_criterion: cluster.wcag_criterion().to_string(),
            selectors: selectors.into_iter().collect(),
            files: cluster.files().into_iter().map(str::to_string).collect(),
        }
    }
}

#[async_trait]
pub trait PatchSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, clusters: &[ClusterDigest]) -> anyhow::Result<Vec<Patch>>;
}

/// Patches produced offline and stored as JSON (an array, or an object
/// with a `patches` array)
#[derive(Debug, Clone)]
pub struct JsonPatchFile {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PatchDocument {
    List(Vec<Patch>),
    Wrapped { patches: Vec<Patch> },
}

impl JsonPatchFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every patch in the file
    pub fn load(&self) -> anyhow::Result<Vec<Patch>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read patch file {}", self.path.display()))?;
        let doc: PatchDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse patch file {}", self.path.display()))?;
        Ok(match doc {
            PatchDocument::List(patches) | PatchDocument::Wrapped { patches } => patches,
        })
    }
}

#[async_trait]
impl PatchSynthesizer for JsonPatchFile {
    fn name(&self) -> &str {
        "json-file"
    }

    /// Patches for the given clusters; patches naming no cluster always pass
    async fn synthesize(&self, clusters: &[ClusterDigest]) -> anyhow::Result<Vec<Patch>> {
        let wanted: BTreeSet<&str> = clusters.iter().map(|c| c.cluster_id.as_str()).collect();
        let patches = self.load()?;
        Ok(patches
            .into_iter()
            .filter(|p| p.cluster_id.as_deref().map_or(true, |id| wanted.contains(id)))
            .collect())
    }
}

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPreviewEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
    pub target: String,
    pub rationale: String,
    pub risks: Vec<String>,
    pub confidence: Confidence,
    /// First 200 characters of the payload
    pub preview: String,
}

/// Read-only overview of a batch before it is applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPreview {
    pub patches: Vec<PatchPreviewEntry>,
    pub total_changes: usize,
    pub files_affected: Vec<String>,
}

pub fn preview_patches(patches: &[Patch]) -> PatchPreview {
    let files: BTreeSet<&str> = patches.iter().map(|p| p.target.as_str()).collect();
    let entries = patches
        .iter()
        .map(|p| {
            let body = match &p.payload {
                PatchPayload::UnifiedDiff(s) | PatchPayload::Replace(s) => s,
            };
            let preview = if body.chars().count() > PREVIEW_CHARS {
                format!("{}...", body.chars().take(PREVIEW_CHARS).collect::<String>())
            } else {
                body.clone()
            };
            PatchPreviewEntry {
                id: p.id.clone(),
                patch_type: p.patch_type,
                target: p.target.clone(),
                rationale: p.rationale.clone(),
                risks: p.risks.clone(),
                confidence: p.confidence,
                preview,
            }
        })
        .collect();

    PatchPreview {
        patches: entries,
        total_changes: patches.len(),
        files_affected: files.into_iter().map(str::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{cluster_findings, ClusteringMethod};
    use crate::core::{Evidence, Finding};
    use tempfile::TempDir;

    fn digest() -> ClusterDigest {
        let finding = Finding::new("AriaAgent", Criterion::Aria, "img.logo", "Image without alt text")
            .with_evidence(Evidence::new("index.html").with_metric("role", "img").with_metric("attribute", "alt"));
        let clusters = cluster_findings(&[finding], ClusteringMethod::RuleBased, 0.7).unwrap();
        ClusterDigest::from(&clusters[0])
    }

    #[test]
    fn test_digest_from_cluster() {
        let d = digest();
        assert_eq!(d.criterion, Criterion::Aria);
        assert_eq!(d.key_components, vec!["img", "alt"]);
        assert_eq!(d.selectors, vec!["img.logo"]);
        assert_eq!(d.files, vec!["index.html"]);
    }

    #[tokio::test]
    async fn test_json_file_filters_by_cluster() {
        let d = digest();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("patches.json");
        let patches = vec![
            Patch::new(PatchType::AttributeAdd, "index.html", "<img alt=\"Logo\">")
                .for_cluster(d.cluster_id.clone(), Criterion::Aria),
            Patch::new(PatchType::CssUpdate, "a.css", "a {}").for_cluster("cluster_other", Criterion::Contrast),
            Patch::new(PatchType::CssUpdate, "b.css", "b {}"),
        ];
        let wrapped = serde_json::json!({ "patches": patches });
        std::fs::write(&path, serde_json::to_string_pretty(&wrapped).unwrap()).unwrap();

        let source = JsonPatchFile::new(&path);
        assert_eq!(source.load().unwrap().len(), 3);
        let picked = source.synthesize(&[d]).await.unwrap();
        let targets: Vec<&str> = picked.iter().map(|p| p.target.as_str()).collect();
        assert_eq!(targets, vec!["index.html", "b.css"]);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = JsonPatchFile::new("/nonexistent/patches.json").load().unwrap_err();
        assert!(err.to_string().contains("Failed to read patch file"));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(300);
        let patches = vec![
            Patch::new(PatchType::CssUpdate, "b.css", long),
            Patch::new(PatchType::CssUpdate, "a.css", "short"),
            Patch::new(PatchType::ContentUpdate, "a.css", "other"),
        ];
        let preview = preview_patches(&patches);
        assert_eq!(preview.total_changes, 3);
        assert_eq!(preview.files_affected, vec!["a.css", "b.css"]);
        assert_eq!(preview.patches[0].preview.len(), 203);
        assert_eq!(preview.patches[1].preview, "short");
    }
}

//! Clustering Engine - collapses raw findings into root-cause clusters
//!
//! Three methods:
//! - `rule_based`: exact [`ClusterKey`] equality
//! - `semantic`: connected components of the graph whose edges join findings
//!   with similarity >= threshold (union-find, so the result is a partition
//!   whatever the input order)
//! - `hybrid`: exact-key buckets, then semantic components inside each bucket
//!
//! Findings with equal keys always have similarity 1, so every bucket is one
//! component at any threshold and `hybrid` yields the same clusters as
//! `rule_based`. It never splits a key bucket.
//!
//! Input order never matters: findings are sorted by id before grouping and
//! clusters are listed by their smallest occurrence id.

mod key;
mod similarity;
mod store;

pub use key::{
    component_of, extract_component, extract_state, normalize_details, normalize_selector, state_of,
    ClusterKey,
};
pub use similarity::{finding_similarity, jaccard, similarity, tokenize, Signature};
pub use store::{ClusterStore, ClusterUpdate, OccurrenceDisposition, SplitCriteria};

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::{Confidence, Criterion, Finding, Severity};
use crate::error::{Error, Result};
use crate::sandbox::Patch;

/// Default edge threshold for semantic grouping
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMethod {
    RuleBased,
    #[default]
    Semantic,
    Hybrid,
}

impl ClusteringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusteringMethod::RuleBased => "rule_based",
            ClusteringMethod::Semantic => "semantic",
            ClusteringMethod::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for ClusteringMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusteringMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "rule_based" | "rules" => Ok(ClusteringMethod::RuleBased),
            "semantic" => Ok(ClusteringMethod::Semantic),
            "hybrid" => Ok(ClusteringMethod::Hybrid),
            other => Err(format!("unknown clustering method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    #[default]
    Open,
    Resolved,
    Ignored,
}

/// Triage priority derived from severity and confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn from_levels(severity: Severity, confidence: Confidence) -> Self {
        match (severity, confidence) {
            (Severity::Critical, Confidence::High) => Priority::Urgent,
            (Severity::Critical | Severity::High, Confidence::High | Confidence::Medium) => Priority::High,
            (Severity::Medium, Confidence::High) => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

fn impact_of(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "Blocks users with disabilities from using the interface",
        Severity::High => "Significantly impacts user experience for users with disabilities",
        Severity::Medium => "Moderately impacts accessibility and user experience",
        Severity::Low => "Minor impact on accessibility",
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Root-cause group owning a non-empty set of findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    id: String,
    key: ClusterKey,
    summary: String,
    /// Set by an operator; survives merges and reassignments
    #[serde(default)]
    summary_pinned: bool,
    severity: Severity,
    confidence: Confidence,
    priority: Priority,
    impact: String,
    wcag_criterion: String,
    status: ClusterStatus,
    occurrences: Vec<Finding>,
    patches: Vec<Patch>,
}

impl Cluster {
    /// Build a cluster; `None` when `occurrences` is empty
    pub fn from_occurrences(mut occurrences: Vec<Finding>) -> Option<Self> {
        if occurrences.is_empty() {
            return None;
        }
        occurrences.sort_by(|a, b| a.id().cmp(b.id()));
        let id = derive_cluster_id(&occurrences);
        let mut cluster = Self {
            id,
            key: ClusterKey::derive(&occurrences[0]),
            summary: String::new(),
            summary_pinned: false,
            severity: Severity::Low,
            confidence: Confidence::High,
            priority: Priority::Low,
            impact: String::new(),
            wcag_criterion: String::new(),
            status: ClusterStatus::Open,
            occurrences,
            patches: Vec::new(),
        };
        cluster.refresh();
        Some(cluster)
    }

    /// Recompute every derived attribute from the occurrences (id excluded)
    pub(crate) fn refresh(&mut self) {
        self.occurrences.sort_by(|a, b| a.id().cmp(b.id()));

        let keys: Vec<ClusterKey> = self.occurrences.iter().map(ClusterKey::derive).collect();
        if let Some(key) = most_frequent(keys) {
            self.key = key;
        }
        if !self.summary_pinned {
            self.summary =
                most_frequent(self.occurrences.iter().map(|f| normalize_details(f.details()))).unwrap_or_default();
        }
        self.wcag_criterion = most_frequent(self.occurrences.iter().map(|f| f.wcag_criterion().to_string()))
            .unwrap_or_default();

        self.severity = self
            .occurrences
            .iter()
            .map(Finding::severity)
            .max()
            .unwrap_or_default();
        self.confidence = self
            .occurrences
            .iter()
            .map(Finding::confidence)
            .min()
            .unwrap_or_default();
        self.priority = Priority::from_levels(self.severity, self.confidence);
        self.impact = impact_of(self.severity).to_string();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn criterion(&self) -> Criterion {
        self.key.criterion
    }

    pub fn key(&self) -> &ClusterKey {
        &self.key
    }

    pub fn root_cause(&self) -> &str {
        &self.key.root_cause
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn impact(&self) -> &str {
        &self.impact
    }

    pub fn wcag_criterion(&self) -> &str {
        &self.wcag_criterion
    }

    pub fn status(&self) -> ClusterStatus {
        self.status
    }

    pub fn occurrences(&self) -> &[Finding] {
        &self.occurrences
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Distinct artifact files touched by the occurrences
    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self
            .occurrences
            .iter()
            .flat_map(|f| f.evidence().iter().map(|e| e.file_path.as_str()))
            .collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    /// True when the summary was set explicitly rather than derived
    pub fn summary_pinned(&self) -> bool {
        self.summary_pinned
    }

    pub(crate) fn set_summary(&mut self, summary: String) {
        self.summary = summary;
        self.summary_pinned = true;
    }

    pub(crate) fn set_status(&mut self, status: ClusterStatus) {
        self.status = status;
    }

    pub(crate) fn attach_patches(&mut self, patches: impl IntoIterator<Item = Patch>) {
        for patch in patches {
            if !self.patches.iter().any(|p| p.id == patch.id) {
                self.patches.push(patch);
            }
        }
    }

    /// Take over another cluster's occurrences and patches. A pinned
    /// summary wins over a derived one; the receiver's wins over the other's.
    pub(crate) fn absorb(&mut self, other: Cluster) {
        if other.summary_pinned && !self.summary_pinned {
            self.set_summary(other.summary);
        }
        self.occurrences.extend(other.occurrences);
        self.attach_patches(other.patches);
        self.refresh();
    }

    pub(crate) fn into_parts(self) -> (Vec<Finding>, Vec<Patch>, ClusterStatus) {
        (self.occurrences, self.patches, self.status)
    }
}

/// `cluster_` + blake3 of the sorted occurrence ids
fn derive_cluster_id(sorted: &[Finding]) -> String {
    let mut hasher = blake3::Hasher::new();
    for f in sorted {
        hasher.update(f.id().as_bytes());
        hasher.update(&[0x1f]);
    }
    format!("cluster_{}", &hasher.finalize().to_hex()[..16])
}

/// Most frequent value; ties go to the smallest
fn most_frequent<T: Ord>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    // max_by_key keeps the last maximum; iterate in reverse so it is the smallest
    counts.into_iter().rev().max_by_key(|(_, n)| *n).map(|(v, _)| v)
}

// ============================================================================
// Clustering
// ============================================================================

/// Disjoint-set forest with path halving and union by size
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }

    /// Members grouped by root, each group in index order
    fn groups(mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        by_root.into_values().collect()
    }
}

/// Connected components of the similarity graph over `members`.
/// Edges never cross criteria, even at threshold 0.
fn semantic_components(members: &[usize], signatures: &[Signature], threshold: f64) -> Vec<Vec<usize>> {
    let n = members.len();
    let linked = |i: usize, j: usize| {
        let (a, b) = (&signatures[members[i]], &signatures[members[j]]);
        a.key.criterion == b.key.criterion && similarity(a, b) >= threshold
    };
    let edges: Vec<(usize, usize)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| (i + 1..n).filter(move |&j| linked(i, j)).map(move |j| (i, j)))
        .collect();

    let mut uf = UnionFind::new(n);
    for (i, j) in edges {
        uf.union(i, j);
    }
    uf.groups()
        .into_iter()
        .map(|g| g.into_iter().map(|i| members[i]).collect())
        .collect()
}

/// Group findings into clusters.
///
/// Every finding lands in exactly one cluster. Fails only on a threshold
/// outside `[0, 1]`.
pub fn cluster_findings(findings: &[Finding], method: ClusteringMethod, threshold: f64) -> Result<Vec<Cluster>> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::InvalidThreshold(threshold));
    }

    let mut sorted: Vec<&Finding> = findings.iter().collect();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));
    let signatures: Vec<Signature> = sorted.par_iter().map(|f| Signature::of(f)).collect();

    let by_key = || {
        let mut buckets: HashMap<&ClusterKey, Vec<usize>> = HashMap::new();
        for (i, sig) in signatures.iter().enumerate() {
            buckets.entry(&sig.key).or_default().push(i);
        }
        buckets.into_values().collect::<Vec<_>>()
    };

    let groups: Vec<Vec<usize>> = match method {
        ClusteringMethod::RuleBased => by_key(),
        ClusteringMethod::Semantic => {
            let all: Vec<usize> = (0..sorted.len()).collect();
            semantic_components(&all, &signatures, threshold)
        }
        ClusteringMethod::Hybrid => by_key()
            .into_iter()
            .flat_map(|bucket| semantic_components(&bucket, &signatures, threshold))
            .collect(),
    };

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter_map(|g| Cluster::from_occurrences(g.into_iter().map(|i| sorted[i].clone()).collect()))
        .collect();
    clusters.sort_by(|a, b| a.occurrences[0].id().cmp(b.occurrences[0].id()));

    tracing::info!(
        "Clustered {} findings into {} clusters ({}, threshold {:.2})",
        findings.len(),
        clusters.len(),
        method,
        threshold
    );
    Ok(clusters)
}

/// `1 - clusters / findings`, 0 when there are no findings
pub fn duplicate_ratio(cluster_count: usize, finding_count: usize) -> f64 {
    if finding_count == 0 {
        return 0.0;
    }
    (1.0 - cluster_count as f64 / finding_count as f64).clamp(0.0, 1.0)
}

// ============================================================================
// Clustering Result
// ============================================================================

/// Report handed to the report collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringResult {
    pub upload_id: String,
    pub clusters: Vec<Cluster>,
    pub total_findings: usize,
    pub clustered_findings: usize,
    pub duplicate_ratio: f64,
    pub method: ClusteringMethod,
    pub threshold: f64,
    pub generated_at: DateTime<Utc>,
}

impl ClusteringResult {
    pub fn new(
        upload_id: impl Into<String>,
        clusters: Vec<Cluster>,
        total_findings: usize,
        method: ClusteringMethod,
        threshold: f64,
    ) -> Self {
        let clustered_findings = clusters.iter().map(Cluster::len).sum();
        Self {
            upload_id: upload_id.into(),
            duplicate_ratio: duplicate_ratio(clusters.len(), total_findings),
            clusters,
            total_findings,
            clustered_findings,
            method,
            threshold,
            generated_at: Utc::now(),
        }
    }

    /// Format as human-readable summary
    pub fn to_human_string(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!("\n  Clustering Report: {}\n  {}\n\n", self.upload_id, "=".repeat(40)));
        out.push_str(&format!("  Findings:         {}\n", self.total_findings));
        out.push_str(&format!("  Clusters:         {}\n", self.clusters.len()));
        out.push_str(&format!("  Duplicate ratio:  {:.1}%\n", self.duplicate_ratio * 100.0));
        out.push_str(&format!("  Method:           {} (threshold {:.2})\n", self.method, self.threshold));
        out.push_str(&format!(
            "  Generated:        {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        for (i, cluster) in self.clusters.iter().enumerate() {
            out.push_str(&format!(
                "  #{} [{}] {} ({} occurrences, {} / {})\n",
                i + 1,
                cluster.priority().as_str().to_uppercase(),
                cluster.root_cause(),
                cluster.len(),
                cluster.severity(),
                cluster.confidence()
            ));
            out.push_str(&format!("    {}\n", cluster.summary()));
        }

        out
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Evidence;

    fn aria(selector: &str, role: &str, severity: Severity) -> Finding {
        Finding::new("AriaAgent", Criterion::Aria, selector, format!("Invalid ARIA role: {role}"))
            .with_severity(severity)
            .with_evidence(Evidence::new("index.html").with_metric("role", role).with_metric("attribute", "role"))
    }

    #[test]
    fn test_priority_table() {
        assert_eq!(Priority::from_levels(Severity::Critical, Confidence::High), Priority::Urgent);
        assert_eq!(Priority::from_levels(Severity::Critical, Confidence::Medium), Priority::High);
        assert_eq!(Priority::from_levels(Severity::High, Confidence::High), Priority::High);
        assert_eq!(Priority::from_levels(Severity::Medium, Confidence::High), Priority::Medium);
        assert_eq!(Priority::from_levels(Severity::Medium, Confidence::Medium), Priority::Low);
        assert_eq!(Priority::from_levels(Severity::High, Confidence::Low), Priority::Low);
    }

    #[test]
    fn test_most_frequent_ties_to_smallest() {
        assert_eq!(most_frequent(vec!["b", "a", "b", "a"]), Some("a"));
        assert_eq!(most_frequent(vec!["c", "b", "c"]), Some("c"));
        assert_eq!(most_frequent(Vec::<String>::new()), None);
    }

    #[test]
    fn test_cluster_aggregates() {
        let cluster = Cluster::from_occurrences(vec![
            aria("div.a", "buton", Severity::Low),
            aria("div.b", "buton", Severity::Critical).with_confidence(Confidence::Low),
            aria("div.c", "buton", Severity::Medium),
        ])
        .unwrap();
        assert_eq!(cluster.severity(), Severity::Critical);
        assert_eq!(cluster.confidence(), Confidence::Low);
        assert_eq!(cluster.priority(), Priority::Low);
        assert_eq!(cluster.summary(), "Invalid ARIA role: buton");
        assert_eq!(cluster.root_cause(), "ARIA issue with buton role and role attribute");
        assert_eq!(cluster.files(), vec!["index.html"]);
        assert!(Cluster::from_occurrences(Vec::new()).is_none());
    }

    #[test]
    fn test_rule_based_groups_by_key() {
        let findings = vec![
            aria("div.a", "buton", Severity::Low),
            aria("div.b", "buton", Severity::Low),
            aria("div.c", "lnk", Severity::Low),
        ];
        let clusters = cluster_findings(&findings, ClusteringMethod::RuleBased, 0.7).unwrap();
        let mut sizes: Vec<usize> = clusters.iter().map(Cluster::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[test]
    fn test_semantic_is_transitive_closure() {
        // a~b and b~c above threshold, a~c below: one component
        let mk = |agent: &str, details: &str| Finding::new(agent, Criterion::Language, "p", details);
        let a = mk("A", "alpha beta gamma delta");
        let b = mk("B", "alpha beta gamma epsilon");
        let c = mk("C", "alpha beta zeta epsilon");
        let t = 0.5;
        // equal keys would short-circuit; give each a distinct lang metric
        let with_lang = |f: Finding, lang: &str| {
            f.with_evidence(Evidence::new("a.html").with_metric("lang_value", lang).with_metric("scope", "element"))
        };
        let (a, b, c) = (with_lang(a, "xx"), with_lang(b, "yy"), with_lang(c, "zz"));
        assert!(finding_similarity(&a, &b) >= t);
        assert!(finding_similarity(&b, &c) >= t);
        assert!(finding_similarity(&a, &c) < t);

        let clusters = cluster_findings(&[a, b, c], ClusteringMethod::Semantic, t).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }

    #[test]
    fn test_equal_keys_cluster_together_under_every_method() {
        let a = aria("main nav a.first", "buton", Severity::Low);
        let b = aria("footer span#totally-different", "buton", Severity::High);
        for method in [ClusteringMethod::RuleBased, ClusteringMethod::Semantic, ClusteringMethod::Hybrid] {
            let clusters = cluster_findings(&[a.clone(), b.clone()], method, 0.7).unwrap();
            assert_eq!(clusters.len(), 1, "{method}");
        }
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(matches!(
            cluster_findings(&[], ClusteringMethod::Semantic, 1.5),
            Err(Error::InvalidThreshold(_))
        ));
        assert!(cluster_findings(&[], ClusteringMethod::Semantic, f64::NAN).is_err());
        assert!(cluster_findings(&[], ClusteringMethod::Semantic, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_ratio() {
        assert_eq!(duplicate_ratio(0, 0), 0.0);
        assert_eq!(duplicate_ratio(5, 5), 0.0);
        assert!((duplicate_ratio(1, 10) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("rule-based".parse::<ClusteringMethod>().unwrap(), ClusteringMethod::RuleBased);
        assert_eq!("HYBRID".parse::<ClusteringMethod>().unwrap(), ClusteringMethod::Hybrid);
        assert!("kmeans".parse::<ClusteringMethod>().is_err());
    }

    #[test]
    fn test_report_human_string() {
        let findings = vec![aria("div.a", "buton", Severity::High), aria("div.b", "buton", Severity::High)];
        let clusters = cluster_findings(&findings, ClusteringMethod::Hybrid, 0.7).unwrap();
        let report = ClusteringResult::new("upload_1", clusters, 2, ClusteringMethod::Hybrid, 0.7);
        assert_eq!(report.clustered_findings, 2);
        assert!((report.duplicate_ratio - 0.5).abs() < 1e-9);

        let text = report.to_human_string();
        assert!(text.contains("Clustering Report: upload_1"));
        assert!(text.contains("Duplicate ratio:  50.0%"));
        assert!(text.contains("[HIGH]"));
    }
}

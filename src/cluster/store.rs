//! Per-upload cluster store.
//!
//! Every mutation (merge / split / update / delete) runs under the upload's
//! own mutex, so two requests against the same upload never interleave while
//! different uploads proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{cluster_findings, component_of, state_of, Cluster, ClusterStatus, ClusteringMethod, ClusteringResult};
use crate::core::Finding;
use crate::error::{Error, Result};
use crate::sandbox::Patch;

type Shelf = Arc<Mutex<BTreeMap<String, Cluster>>>;

/// How `split` partitions a cluster's occurrences
#[derive(Clone)]
pub enum SplitCriteria {
    Component,
    Severity,
    Confidence,
    State,
    /// First evidence file
    File,
    Custom(Arc<dyn Fn(&Finding) -> String + Send + Sync>),
}

impl SplitCriteria {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Finding) -> String + Send + Sync + 'static,
    {
        SplitCriteria::Custom(Arc::new(f))
    }

    fn key_of(&self, finding: &Finding) -> String {
        match self {
            SplitCriteria::Component => component_of(finding),
            SplitCriteria::Severity => finding.severity().to_string(),
            SplitCriteria::Confidence => finding.confidence().to_string(),
            SplitCriteria::State => state_of(finding),
            SplitCriteria::File => finding.primary_file().unwrap_or("unknown").to_string(),
            SplitCriteria::Custom(f) => f(finding),
        }
    }
}

impl std::fmt::Debug for SplitCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SplitCriteria::Component => "Component",
            SplitCriteria::Severity => "Severity",
            SplitCriteria::Confidence => "Confidence",
            SplitCriteria::State => "State",
            SplitCriteria::File => "File",
            SplitCriteria::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Partial edit applied by `update`
#[derive(Debug, Clone, Default)]
pub struct ClusterUpdate {
    pub summary: Option<String>,
    pub status: Option<ClusterStatus>,
    pub add_patches: Vec<Patch>,
}

impl ClusterUpdate {
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn status(mut self, status: ClusterStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn patch(mut self, patch: Patch) -> Self {
        self.add_patches.push(patch);
        self
    }
}

/// What happens to a deleted cluster's occurrences
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccurrenceDisposition {
    /// Move them (and the patches) into another live cluster
    Reassign(String),
    /// Drop them from the store and hand them back to the caller
    Discard,
}

#[derive(Debug, Default)]
pub struct ClusterStore {
    uploads: RwLock<HashMap<String, Shelf>>,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shelf(&self, upload_id: &str) -> Option<Shelf> {
        self.uploads.read().get(upload_id).cloned()
    }

    fn shelf_or_insert(&self, upload_id: &str) -> Shelf {
        if let Some(shelf) = self.shelf(upload_id) {
            return shelf;
        }
        self.uploads
            .write()
            .entry(upload_id.to_string())
            .or_default()
            .clone()
    }

    /// Cluster `findings` and replace whatever the upload held before
    pub fn cluster(
        &self,
        upload_id: &str,
        findings: &[Finding],
        method: ClusteringMethod,
        threshold: f64,
    ) -> Result<ClusteringResult> {
        let clusters = cluster_findings(findings, method, threshold)?;
        let shelf = self.shelf_or_insert(upload_id);
        {
            let mut guard = shelf.lock();
            guard.clear();
            for c in &clusters {
                guard.insert(c.id().to_string(), c.clone());
            }
        }
        Ok(ClusteringResult::new(upload_id, clusters, findings.len(), method, threshold))
    }

    pub fn get(&self, upload_id: &str, cluster_id: &str) -> Result<Cluster> {
        self.shelf(upload_id)
            .and_then(|shelf| shelf.lock().get(cluster_id).cloned())
            .ok_or_else(|| not_found(cluster_id))
    }

    /// Clusters ordered by their smallest occurrence id
    pub fn list(&self, upload_id: &str) -> Vec<Cluster> {
        let Some(shelf) = self.shelf(upload_id) else {
            return Vec::new();
        };
        let mut clusters: Vec<Cluster> = shelf.lock().values().cloned().collect();
        clusters.sort_by(|a, b| first_id(a).cmp(first_id(b)));
        clusters
    }

    /// Total findings held by the upload's clusters
    pub fn occurrence_count(&self, upload_id: &str) -> usize {
        self.shelf(upload_id)
            .map(|shelf| shelf.lock().values().map(Cluster::len).sum())
            .unwrap_or(0)
    }

    /// Union `targets` into `source`. The source keeps its id.
    pub fn merge(&self, upload_id: &str, source: &str, targets: &[String]) -> Result<Cluster> {
        let shelf = self.shelf(upload_id).ok_or_else(|| not_found(source))?;
        let mut guard = shelf.lock();

        if !guard.contains_key(source) {
            return Err(not_found(source));
        }
        if let Some(missing) = targets.iter().find(|t| !guard.contains_key(t.as_str())) {
            return Err(not_found(missing));
        }

        let mut absorbed = Vec::new();
        for target in targets {
            if target == source {
                continue;
            }
            if let Some(cluster) = guard.remove(target) {
                absorbed.push(cluster);
            }
        }

        let merged = guard.get_mut(source).ok_or_else(|| not_found(source))?;
        let count = absorbed.len();
        for cluster in absorbed {
            merged.absorb(cluster);
        }
        if count > 0 {
            tracing::info!("Merged {} clusters into {} ({} occurrences)", count, source, merged.len());
        }
        Ok(merged.clone())
    }

    /// Partition a cluster's occurrences by `criteria`.
    ///
    /// Each group becomes a new cluster carrying the original's status and
    /// patches; the original is removed. A single group leaves the cluster
    /// untouched.
    pub fn split(&self, upload_id: &str, cluster_id: &str, criteria: &SplitCriteria) -> Result<Vec<Cluster>> {
        let shelf = self.shelf(upload_id).ok_or_else(|| not_found(cluster_id))?;
        let mut guard = shelf.lock();

        let original = guard.get(cluster_id).ok_or_else(|| not_found(cluster_id))?;
        let mut groups: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
        for finding in original.occurrences() {
            groups.entry(criteria.key_of(finding)).or_default().push(finding.clone());
        }
        if groups.len() <= 1 {
            return Ok(vec![original.clone()]);
        }

        let original = guard.remove(cluster_id).ok_or_else(|| not_found(cluster_id))?;
        let (_, patches, status) = original.into_parts();

        let mut created = Vec::with_capacity(groups.len());
        for occurrences in groups.into_values() {
            if let Some(mut cluster) = Cluster::from_occurrences(occurrences) {
                cluster.attach_patches(patches.iter().cloned());
                cluster.set_status(status);
                guard.insert(cluster.id().to_string(), cluster.clone());
                created.push(cluster);
            }
        }
        tracing::info!("Split {} into {} clusters by {:?}", cluster_id, created.len(), criteria);
        Ok(created)
    }

    pub fn update(&self, upload_id: &str, cluster_id: &str, update: ClusterUpdate) -> Result<Cluster> {
        let shelf = self.shelf(upload_id).ok_or_else(|| not_found(cluster_id))?;
        let mut guard = shelf.lock();
        let cluster = guard.get_mut(cluster_id).ok_or_else(|| not_found(cluster_id))?;

        if let Some(summary) = update.summary {
            cluster.set_summary(summary);
        }
        if let Some(status) = update.status {
            cluster.set_status(status);
        }
        cluster.attach_patches(update.add_patches);
        Ok(cluster.clone())
    }

    /// Remove a cluster. Returns the discarded findings (empty on reassign).
    pub fn delete(&self, upload_id: &str, cluster_id: &str, disposition: OccurrenceDisposition) -> Result<Vec<Finding>> {
        let shelf = self.shelf(upload_id).ok_or_else(|| not_found(cluster_id))?;
        let mut guard = shelf.lock();

        if !guard.contains_key(cluster_id) {
            return Err(not_found(cluster_id));
        }
        match disposition {
            OccurrenceDisposition::Reassign(target) => {
                if target == cluster_id || !guard.contains_key(&target) {
                    return Err(not_found(&target));
                }
                let removed = guard.remove(cluster_id).ok_or_else(|| not_found(cluster_id))?;
                let receiver = guard.get_mut(&target).ok_or_else(|| not_found(&target))?;
                tracing::info!("Deleted {}; {} occurrences moved to {}", cluster_id, removed.len(), target);
                receiver.absorb(removed);
                Ok(Vec::new())
            }
            OccurrenceDisposition::Discard => {
                let removed = guard.remove(cluster_id).ok_or_else(|| not_found(cluster_id))?;
                let (occurrences, _, _) = removed.into_parts();
                tracing::warn!("Deleted {}; discarded {} occurrences", cluster_id, occurrences.len());
                Ok(occurrences)
            }
        }
    }

    /// Forget an upload entirely
    pub fn clear(&self, upload_id: &str) -> bool {
        self.uploads.write().remove(upload_id).is_some()
    }
}

fn first_id(cluster: &Cluster) -> &str {
    cluster.occurrences().first().map(Finding::id).unwrap_or("")
}

fn not_found(id: &str) -> Error {
    Error::ClusterNotFound { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Criterion, Evidence, Severity};
    use crate::sandbox::{Patch, PatchType};

    fn contrast(selector: &str, fg: &str, file: &str, severity: Severity) -> Finding {
        Finding::new("ContrastAgent", Criterion::Contrast, selector, "Insufficient contrast")
            .with_severity(severity)
            .with_evidence(
                Evidence::new(file)
                    .with_metric("foreground", fg)
                    .with_metric("background", "#ffffff"),
            )
    }

    fn seeded() -> (ClusterStore, Vec<Cluster>) {
        let store = ClusterStore::new();
        let findings = vec![
            contrast(".btn", "#777777", "a.css", Severity::Medium),
            contrast(".btn.primary", "#888888", "a.css", Severity::High),
            contrast(".nav", "#777777", "b.css", Severity::Low),
            contrast(".nav:hover", "#777777", "b.css", Severity::Low),
        ];
        let result = store.cluster("u1", &findings, ClusteringMethod::RuleBased, 0.7).unwrap();
        (store, result.clusters)
    }

    #[test]
    fn test_cluster_replaces_previous() {
        let (store, clusters) = seeded();
        assert_eq!(store.list("u1").len(), clusters.len());
        assert_eq!(store.occurrence_count("u1"), 4);

        store
            .cluster("u1", &[contrast(".x", "#111111", "c.css", Severity::Low)], ClusteringMethod::RuleBased, 0.7)
            .unwrap();
        assert_eq!(store.list("u1").len(), 1);
        assert!(store.list("other").is_empty());
    }

    #[test]
    fn test_merge_preserves_count() {
        let (store, clusters) = seeded();
        let source = clusters[0].id().to_string();
        let targets: Vec<String> = clusters[1..].iter().map(|c| c.id().to_string()).collect();

        let merged = store.merge("u1", &source, &targets).unwrap();
        assert_eq!(merged.id(), source);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.severity(), Severity::High);
        assert_eq!(store.list("u1").len(), 1);
        assert_eq!(store.occurrence_count("u1"), 4);
    }

    #[test]
    fn test_merge_edge_cases() {
        let (store, clusters) = seeded();
        let source = clusters[0].id().to_string();

        let same = store.merge("u1", &source, &[]).unwrap();
        assert_eq!(same, clusters[0]);
        let same = store.merge("u1", &source, &[source.clone()]).unwrap();
        assert_eq!(same.len(), clusters[0].len());

        let err = store.merge("u1", &source, &["cluster_missing".to_string()]).unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound { ref id } if id == "cluster_missing"));
        // failed merge leaves the store untouched
        assert_eq!(store.list("u1").len(), clusters.len());
    }

    #[test]
    fn test_split_by_file() {
        let (store, _) = seeded();
        let all: Vec<String> = store.list("u1").iter().map(|c| c.id().to_string()).collect();
        let merged = store.merge("u1", &all[0], &all[1..]).unwrap();

        let patch = Patch::new(PatchType::CssUpdate, "a.css", "body {}");
        store.update("u1", merged.id(), ClusterUpdate::default().patch(patch)).unwrap();

        let parts = store.split("u1", merged.id(), &SplitCriteria::File).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.iter().map(Cluster::len).sum::<usize>(), 4);
        assert!(parts.iter().all(|c| c.patches().len() == 1));
        assert!(store.get("u1", merged.id()).is_err());
        assert_eq!(store.occurrence_count("u1"), 4);
    }

    #[test]
    fn test_split_single_group_is_noop() {
        let (store, clusters) = seeded();
        let id = clusters[0].id();
        let parts = store.split("u1", id, &SplitCriteria::custom(|_| "same".to_string())).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].id(), id);
        assert!(store.get("u1", id).is_ok());
    }

    #[test]
    fn test_update_fields() {
        let (store, clusters) = seeded();
        let id = clusters[0].id();
        let updated = store
            .update("u1", id, ClusterUpdate::default().summary("Brand grey too light").status(ClusterStatus::Resolved))
            .unwrap();
        assert_eq!(updated.summary(), "Brand grey too light");
        assert_eq!(updated.status(), ClusterStatus::Resolved);
        assert!(matches!(
            store.update("u1", "nope", ClusterUpdate::default()),
            Err(Error::ClusterNotFound { .. })
        ));
    }

    #[test]
    fn test_delete_reassign_and_discard() {
        let (store, clusters) = seeded();
        assert!(clusters.len() >= 3);
        let (a, b, c) = (clusters[0].id(), clusters[1].id(), clusters[2].id());

        // reassigning to itself or to nothing is refused
        assert!(store.delete("u1", a, OccurrenceDisposition::Reassign(a.to_string())).is_err());
        assert!(store.delete("u1", a, OccurrenceDisposition::Reassign("x".into())).is_err());

        let dropped = store.delete("u1", a, OccurrenceDisposition::Reassign(b.to_string())).unwrap();
        assert!(dropped.is_empty());
        assert_eq!(store.occurrence_count("u1"), 4);

        let discarded = store.delete("u1", c, OccurrenceDisposition::Discard).unwrap();
        assert_eq!(store.occurrence_count("u1") + discarded.len(), 4);
        assert!(store.get("u1", c).is_err());
    }

    #[test]
    fn test_pinned_summary_survives_merge_and_reassign() {
        let (store, clusters) = seeded();
        let (a, b, c) = (clusters[0].id(), clusters[1].id(), clusters[2].id());

        store.update("u1", a, ClusterUpdate::default().summary("Brand grey too light")).unwrap();
        let merged = store.merge("u1", a, &[b.to_string()]).unwrap();
        assert_eq!(merged.summary(), "Brand grey too light");
        assert!(merged.summary_pinned());

        // the receiver adopts a pinned summary from what it absorbs
        store.delete("u1", a, OccurrenceDisposition::Reassign(c.to_string())).unwrap();
        let receiver = store.get("u1", c).unwrap();
        assert_eq!(receiver.summary(), "Brand grey too light");

        // split parts describe their own occurrences again
        let parts = store.split("u1", c, &SplitCriteria::File).unwrap();
        assert!(parts.iter().all(|p| !p.summary_pinned()));
    }

    #[test]
    fn test_parallel_merge_and_split_lose_nothing() {
        let store = ClusterStore::new();
        let findings: Vec<Finding> = (0..48)
            .map(|i| {
                let fg = format!("#{:06x}", i * 4099);
                contrast(&format!(".c{i}"), &fg, &format!("f{}.css", i % 4), Severity::Medium)
            })
            .collect();
        store.cluster("u1", &findings, ClusteringMethod::RuleBased, 0.7).unwrap();
        assert_eq!(store.list("u1").len(), 48);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for round in 0..40 {
                        let ids: Vec<String> = store.list("u1").iter().map(|c| c.id().to_string()).collect();
                        if ids.len() < 2 {
                            continue;
                        }
                        let source = &ids[(t + round) % ids.len()];
                        let target = ids[(t + round + 1) % ids.len()].clone();
                        // a racing thread may have consumed either id already
                        let _ = store.merge("u1", source, &[target]);
                    }
                });
            }
            for _ in 0..2 {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..40 {
                        let largest = store.list("u1").into_iter().max_by_key(Cluster::len);
                        if let Some(cluster) = largest {
                            let _ = store.split("u1", cluster.id(), &SplitCriteria::File);
                        }
                    }
                });
            }
        });

        assert_eq!(store.occurrence_count("u1"), 48);
        let mut seen: Vec<String> = store
            .list("u1")
            .iter()
            .flat_map(|c| c.occurrences().iter().map(|f| f.id().to_string()))
            .collect();
        seen.sort();
        let mut expected: Vec<String> = findings.iter().map(|f| f.id().to_string()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }
}

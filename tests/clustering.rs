//! Clustering invariants over generated findings

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use a11y_triage::cluster::{cluster_findings, duplicate_ratio, ClusterStore, ClusteringMethod, SplitCriteria};
use a11y_triage::{Criterion, Evidence, Finding, Severity};

const METHODS: [ClusteringMethod; 3] = [
    ClusteringMethod::RuleBased,
    ClusteringMethod::Semantic,
    ClusteringMethod::Hybrid,
];

fn finding_strategy() -> impl Strategy<Value = Finding> {
    (
        prop::sample::select(vec!["ContrastAgent", "AriaAgent", "LanguageAgent"]),
        prop::sample::select(Criterion::ALL.to_vec()),
        prop::sample::select(vec![".btn", ".btn.primary", ".nav:hover", "img#logo", "html", "a.link"]),
        prop::sample::select(vec!["low contrast text", "missing alt", "invalid role menu", "focus outline removed"]),
        prop::sample::select(vec!["a.css", "b.css", "index.html"]),
        prop::sample::select(vec![Severity::Low, Severity::Medium, Severity::High, Severity::Critical]),
    )
        .prop_map(|(agent, criterion, selector, details, file, severity)| {
            Finding::new(agent, criterion, selector, details)
                .with_severity(severity)
                .with_evidence(Evidence::new(file))
        })
}

/// Findings with distinct ids, plus a shuffled copy
fn findings_and_permutation() -> impl Strategy<Value = (Vec<Finding>, Vec<Finding>)> {
    prop::collection::vec(finding_strategy(), 0..24).prop_flat_map(|raw| {
        let unique: BTreeMap<String, Finding> = raw.into_iter().map(|f| (f.id().to_string(), f)).collect();
        let findings: Vec<Finding> = unique.into_values().collect();
        (Just(findings.clone()), Just(findings).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn prop_input_order_does_not_matter((findings, shuffled) in findings_and_permutation(), threshold in 0.0f64..=1.0) {
        for method in METHODS {
            let a = cluster_findings(&findings, method, threshold).unwrap();
            let b = cluster_findings(&shuffled, method, threshold).unwrap();
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn prop_clusters_partition_findings((findings, _) in findings_and_permutation(), threshold in 0.0f64..=1.0) {
        let expected: BTreeSet<&str> = findings.iter().map(Finding::id).collect();
        for method in METHODS {
            let clusters = cluster_findings(&findings, method, threshold).unwrap();
            let total: usize = clusters.iter().map(|c| c.len()).sum();
            prop_assert_eq!(total, findings.len());

            let seen: BTreeSet<&str> = clusters.iter().flat_map(|c| c.occurrences()).map(Finding::id).collect();
            prop_assert_eq!(&seen, &expected);
            prop_assert!(clusters.iter().all(|c| !c.is_empty()));

            let ratio = duplicate_ratio(clusters.len(), findings.len());
            prop_assert!((0.0..=1.0).contains(&ratio));
        }
    }

    #[test]
    fn prop_equal_keys_share_a_cluster((findings, _) in findings_and_permutation(), threshold in 0.0f64..=1.0) {
        for method in METHODS {
            let clusters = cluster_findings(&findings, method, threshold).unwrap();
            let mut owner: BTreeMap<String, &str> = BTreeMap::new();
            for cluster in &clusters {
                for f in cluster.occurrences() {
                    let key = format!("{:?}", a11y_triage::ClusterKey::derive(f));
                    let previous = owner.insert(key, cluster.id());
                    prop_assert!(previous.map_or(true, |id| id == cluster.id()));
                }
            }
        }
    }

    #[test]
    fn prop_hybrid_matches_rule_based((findings, _) in findings_and_permutation(), threshold in 0.0f64..=1.0) {
        let hybrid = cluster_findings(&findings, ClusteringMethod::Hybrid, threshold).unwrap();
        let rule_based = cluster_findings(&findings, ClusteringMethod::RuleBased, threshold).unwrap();
        prop_assert_eq!(hybrid, rule_based);
    }

    #[test]
    fn prop_merge_and_split_keep_every_occurrence((findings, _) in findings_and_permutation()) {
        prop_assume!(!findings.is_empty());
        let store = ClusterStore::new();
        store.cluster("up", &findings, ClusteringMethod::RuleBased, 0.7).unwrap();

        let ids: Vec<String> = store.list("up").iter().map(|c| c.id().to_string()).collect();
        let merged = store.merge("up", &ids[0], &ids[1..]).unwrap();
        prop_assert_eq!(merged.len(), findings.len());
        prop_assert_eq!(store.list("up").len(), 1);

        let parts = store.split("up", merged.id(), &SplitCriteria::File).unwrap();
        prop_assert_eq!(parts.iter().map(|c| c.len()).sum::<usize>(), findings.len());
        prop_assert_eq!(store.occurrence_count("up"), findings.len());
    }
}

#[test]
fn test_invalid_threshold_rejected_for_every_method() {
    for method in METHODS {
        assert!(cluster_findings(&[], method, 1.5).is_err());
        assert!(cluster_findings(&[], method, f64::NAN).is_err());
        assert!(cluster_findings(&[], method, 0.0).unwrap().is_empty());
    }
}

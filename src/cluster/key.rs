//! Cluster keys: the criterion-specific root-cause signature of a finding

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{Criterion, Finding};

const UNKNOWN: &str = "unknown";

/// Pseudo-classes recognised as interaction states, in lookup order
const STATES: &[&str] = &[
    "hover", "focus", "active", "disabled", "selected", "expanded", "collapsed",
];

/// Derived grouping key. Never stored apart from its cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub criterion: Criterion,
    /// Normalised components, fixed arity per criterion
    pub components: Vec<String>,
    pub root_cause: String,
}

impl ClusterKey {
    /// Derive the key of one finding
    pub fn derive(finding: &Finding) -> Self {
        let component = component_of(finding);
        let state = state_of(finding);
        let metric = |key: &str| {
            finding
                .metric(key)
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string())
        };

        let criterion = finding.criterion();
        let (components, root_cause) = match criterion {
            Criterion::Contrast => {
                let colors = match (finding.metric("foreground"), finding.metric("background")) {
                    (Some(fg), Some(bg)) => format!("{}-{}", fg.to_lowercase(), bg.to_lowercase()),
                    _ => UNKNOWN.to_string(),
                };
                let label = format!("Contrast issue with {} in {} ({})", colors, component, state);
                (vec![colors, component, state], label)
            }
            Criterion::SeizureSafe => {
                let animation = metric("animation_type");
                let frequency = metric("frequency");
                let label = format!(
                    "Seizure risk with {} animation at {}Hz in {}",
                    animation, frequency, component
                );
                (vec![animation, frequency, component], label)
            }
            Criterion::Language => {
                let lang = metric("lang_value");
                let scope = metric("scope");
                let label = format!("Language issue with {} in {}", lang, scope);
                (vec![lang, scope], label)
            }
            Criterion::Aria => {
                let role = metric("role");
                let attribute = metric("attribute");
                let label = format!("ARIA issue with {} role and {} attribute", role, attribute);
                (vec![role, attribute], label)
            }
            Criterion::StateExplorer => {
                let label = format!("State issue with {} in {} state", component, state);
                (vec![component, state], label)
            }
        };

        Self {
            criterion,
            components,
            root_cause,
        }
    }

    /// Compact `criterion:a:b:c` form
    pub fn signature(&self) -> String {
        let mut s = self.criterion.as_str().to_string();
        for c in &self.components {
            s.push(':');
            s.push_str(c);
        }
        s
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Collapse runs of whitespace and trim
pub fn normalize_selector(selector: &str) -> String {
    selector.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Same normalisation for free-text details
pub fn normalize_details(details: &str) -> String {
    normalize_selector(details)
}

fn id_or_class_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([#.])([a-zA-Z0-9_-]+)").ok())
        .as_ref()
}

/// Component name from a selector: first `#id`, else first `.class`, else
/// the first compound selector
pub fn extract_component(selector: &str) -> String {
    let selector = normalize_selector(selector);
    if let Some(re) = id_or_class_regex() {
        let mut class = None;
        for caps in re.captures_iter(&selector) {
            match (&caps[1], caps.get(2)) {
                ("#", Some(id)) => return id.as_str().to_string(),
                (".", Some(c)) if class.is_none() => class = Some(c.as_str().to_string()),
                _ => {}
            }
        }
        if let Some(class) = class {
            return class;
        }
    }
    selector
        .split_whitespace()
        .next()
        .map(|s| s.split(':').next().unwrap_or(s).to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Interaction state from a selector, `default` when none is present
pub fn extract_state(selector: &str) -> String {
    STATES
        .iter()
        .find(|s| selector.contains(&format!(":{}", s)))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "default".to_string())
}

/// Explicit component id, else extracted from the selector
pub fn component_of(finding: &Finding) -> String {
    finding
        .component_id()
        .map(str::to_string)
        .unwrap_or_else(|| extract_component(finding.selector()))
}

/// Explicit state, else extracted from the selector
pub fn state_of(finding: &Finding) -> String {
    finding
        .state()
        .map(str::to_string)
        .unwrap_or_else(|| extract_state(finding.selector()))
}

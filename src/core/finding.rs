use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Confidence, Criterion, Severity};

/// One piece of evidence attached to a finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Artifact path relative to the manifest root
    pub file_path: String,
    pub line: Option<u32>,
    pub snippet: Option<String>,
    /// Detector metrics (e.g. `foreground`, `background`, `role`)
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
}

impl Evidence {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            line: None,
            snippet: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }
}

/// An immutable record of one detected defect.
///
/// The id is derived from `(agent, criterion, selector, state)` so the same
/// defect re-detected in a later pass (e.g. inside a sandbox) has the same id.
/// Fields are only reachable through accessors; the builder methods consume
/// the value and recompute the id whenever an identity field changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    id: String,
    criterion: Criterion,
    selector: String,
    component_id: Option<String>,
    screen: Option<String>,
    state: Option<String>,
    details: String,
    evidence: Vec<Evidence>,
    severity: Severity,
    confidence: Confidence,
    wcag_criterion: String,
    agent: String,
}

impl Finding {
    pub fn new(
        agent: impl Into<String>,
        criterion: Criterion,
        selector: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        let agent = agent.into();
        let selector = selector.into();
        let id = Self::derive_id(&agent, criterion, &selector, None);
        Self {
            id,
            criterion,
            selector,
            component_id: None,
            screen: None,
            state: None,
            details: details.into(),
            evidence: Vec::new(),
            severity: Severity::default(),
            confidence: Confidence::default(),
            wcag_criterion: criterion.default_wcag().to_string(),
            agent,
        }
    }

    /// Deterministic identity: blake3 over the identity fields
    pub fn derive_id(agent: &str, criterion: Criterion, selector: &str, state: Option<&str>) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [agent, criterion.as_str(), selector, state.unwrap_or("")] {
            hasher.update(part.as_bytes());
            // unit separator keeps ("ab","c") distinct from ("a","bc")
            hasher.update(&[0x1f]);
        }
        let hex = hasher.finalize().to_hex();
        format!("finding_{}", &hex[..16])
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self.id = Self::derive_id(&self.agent, self.criterion, &self.selector, self.state.as_deref());
        self
    }

    pub fn with_component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = Some(component_id.into());
        self
    }

    pub fn with_screen(mut self, screen: impl Into<String>) -> Self {
        self.screen = Some(screen.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_wcag(mut self, wcag: impl Into<String>) -> Self {
        self.wcag_criterion = wcag.into();
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn component_id(&self) -> Option<&str> {
        self.component_id.as_deref()
    }

    pub fn screen(&self) -> Option<&str> {
        self.screen.as_deref()
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn wcag_criterion(&self) -> &str {
        &self.wcag_criterion
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// First metric value with this key across the evidence list
    pub fn metric(&self, key: &str) -> Option<&str> {
        self.evidence
            .iter()
            .find_map(|e| e.metrics.get(key).map(String::as_str))
    }

    /// File of the first evidence item, if any
    pub fn primary_file(&self) -> Option<&str> {
        self.evidence.first().map(|e| e.file_path.as_str())
    }
}

//! Core module - shared vocabulary of the triage pipeline
//!
//! Closed enumerations for criterion, severity and confidence, the immutable
//! [`Finding`] record and the read-only artifact [`Manifest`].

mod finding;
mod manifest;

pub use finding::{Evidence, Finding};
pub use manifest::{ArtifactKind, Manifest, ManifestEntry};

use serde::{Deserialize, Serialize};

/// Category of accessibility rule a detector checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Contrast,
    SeizureSafe,
    Language,
    Aria,
    StateExplorer,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::Contrast,
        Criterion::SeizureSafe,
        Criterion::Language,
        Criterion::Aria,
        Criterion::StateExplorer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::Contrast => "contrast",
            Criterion::SeizureSafe => "seizure_safe",
            Criterion::Language => "language",
            Criterion::Aria => "aria",
            Criterion::StateExplorer => "state_explorer",
        }
    }

    /// WCAG success criterion most findings of this category map to
    pub fn default_wcag(&self) -> &'static str {
        match self {
            Criterion::Contrast => "1.4.3",
            Criterion::SeizureSafe => "2.3.1",
            Criterion::Language => "3.1.1",
            Criterion::Aria => "4.1.2",
            Criterion::StateExplorer => "2.4.7",
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity, ordered low < medium < high < critical
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector confidence, ordered low < medium < high
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    #[default]
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

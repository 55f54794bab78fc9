//! Reference detectors
//!
//! Small regex-driven detectors covering each criterion. They exist so the
//! pipeline can run end to end; richer detectors plug in through the same
//! [`DetectorAgent`] trait.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;

use super::css::{self, contrast_ratio, find_color, parse_time, CssRule};
use super::{AgentContext, AgentDescriptor, AgentOutput, DetectorAgent};
use crate::cluster::normalize_selector;
use crate::core::{ArtifactKind, Confidence, Criterion, Evidence, Finding, Manifest, Severity};

/// WCAG AA minimum for normal text
pub const DEFAULT_CONTRAST_THRESHOLD: f64 = 4.5;

/// Animations faster than this per cycle exceed three flashes a second
pub const MIN_SAFE_CYCLE_SECS: f64 = 0.333;

/// Roles from WAI-ARIA 1.2 that may appear in markup
const KNOWN_ROLES: &[&str] = &[
    "alert", "alertdialog", "application", "article", "banner", "blockquote", "button", "caption",
    "cell", "checkbox", "code", "columnheader", "combobox", "complementary", "contentinfo",
    "definition", "deletion", "dialog", "directory", "document", "emphasis", "feed", "figure",
    "form", "generic", "grid", "gridcell", "group", "heading", "img", "insertion", "link", "list",
    "listbox", "listitem", "log", "main", "marquee", "math", "menu", "menubar", "menuitem",
    "menuitemcheckbox", "menuitemradio", "meter", "navigation", "none", "note", "option",
    "paragraph", "presentation", "progressbar", "radio", "radiogroup", "region", "row",
    "rowgroup", "rowheader", "scrollbar", "search", "searchbox", "separator", "slider",
    "spinbutton", "status", "strong", "subscript", "superscript", "switch", "tab", "table",
    "tablist", "tabpanel", "term", "textbox", "time", "timer", "toolbar", "tooltip", "tree",
    "treegrid", "treeitem",
];

/// Rules of every stylesheet in the manifest, paired with the display path
fn stylesheet_rules(manifest: &Manifest) -> anyhow::Result<Vec<(String, CssRule)>> {
    let mut out = Vec::new();
    for entry in manifest.entries_of(ArtifactKind::Stylesheet) {
        let content = manifest.read_to_string(entry)?;
        let path = entry.display_path();
        out.extend(css::parse_rules(&content)?.into_iter().map(|r| (path.clone(), r)));
    }
    Ok(out)
}

// ============================================================================
// ContrastAgent
// ============================================================================

/// Text colour against background colour declared in the same rule
pub struct ContrastAgent {
    descriptor: AgentDescriptor,
    threshold: f64,
}

impl ContrastAgent {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_CONTRAST_THRESHOLD)
    }

    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            descriptor: AgentDescriptor::new("ContrastAgent", &[Criterion::Contrast])
                .with_priority(90)
                .with_estimate(60),
            threshold,
        }
    }

    /// Severity grows with the distance below the threshold
    fn severity_for(&self, ratio: f64) -> Severity {
        let deficit = self.threshold - ratio;
        if deficit <= 0.5 {
            Severity::Low
        } else if deficit <= 1.0 {
            Severity::Medium
        } else if deficit <= 2.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

impl Default for ContrastAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectorAgent for ContrastAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn is_applicable(&self, manifest: &Manifest) -> bool {
        manifest.has_kind(ArtifactKind::Stylesheet)
    }

    async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
        let mut findings = Vec::new();
        for (path, rule) in stylesheet_rules(&ctx.manifest)? {
            if rule.is_keyframe_step() {
                continue;
            }
            let fg = rule.get("color").and_then(find_color);
            let bg = rule
                .get("background-color")
                .or_else(|| rule.get("background"))
                .and_then(find_color);
            let (Some(fg), Some(bg)) = (fg, bg) else {
                continue;
            };

            let ratio = contrast_ratio(fg, bg);
            if ratio >= self.threshold {
                continue;
            }

            let selector = normalize_selector(&rule.selector);
            findings.push(
                Finding::new(
                    self.name(),
                    Criterion::Contrast,
                    selector.clone(),
                    format!(
                        "Text contrast ratio {:.2}:1 is below the required {:.1}:1",
                        ratio, self.threshold
                    ),
                )
                .with_severity(self.severity_for(ratio))
                .with_confidence(Confidence::High)
                .with_evidence(
                    Evidence::new(path)
                        .at_line(rule.line)
                        .with_snippet(format!("{} {{ color: {}; background: {} }}", selector, fg.hex(), bg.hex()))
                        .with_metric("foreground", fg.hex())
                        .with_metric("background", bg.hex())
                        .with_metric("ratio", format!("{:.2}", ratio)),
                ),
            );
        }
        Ok(AgentOutput::new(findings))
    }
}

// ============================================================================
// SeizureSafeAgent
// ============================================================================

/// Infinite animations that cycle more than three times per second
pub struct SeizureSafeAgent {
    descriptor: AgentDescriptor,
}

impl SeizureSafeAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new("SeizureSafeAgent", &[Criterion::SeizureSafe])
                .with_priority(100)
                .with_estimate(45),
        }
    }
}

impl Default for SeizureSafeAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// (animation name, cycle seconds, infinite) from shorthand or longhands
fn animation_of(rule: &CssRule) -> Option<(String, f64, bool)> {
    let mut name = rule.get("animation-name").map(str::to_string);
    let mut duration = rule.get("animation-duration").and_then(parse_time);
    let mut infinite = rule
        .get("animation-iteration-count")
        .map(|v| v.eq_ignore_ascii_case("infinite"))
        .unwrap_or(false);

    if let Some(shorthand) = rule.get("animation") {
        for token in shorthand.split_whitespace() {
            if token.eq_ignore_ascii_case("infinite") {
                infinite = true;
            } else if let Some(secs) = parse_time(token) {
                // first time token is the duration, the second the delay
                duration.get_or_insert(secs);
            } else if name.is_none()
                && token.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && !is_animation_keyword(token)
            {
                name = Some(token.to_string());
            }
        }
    }

    Some((name.unwrap_or_else(|| "animation".to_string()), duration?, infinite))
}

fn is_animation_keyword(token: &str) -> bool {
    matches!(
        token.to_lowercase().as_str(),
        "linear" | "ease" | "ease-in" | "ease-out" | "ease-in-out" | "step-start" | "step-end"
            | "normal" | "reverse" | "alternate" | "alternate-reverse" | "forwards" | "backwards"
            | "both" | "none" | "running" | "paused"
    ) || token.contains('(')
}

#[async_trait]
impl DetectorAgent for SeizureSafeAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn is_applicable(&self, manifest: &Manifest) -> bool {
        manifest.has_kind(ArtifactKind::Stylesheet)
    }

    async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
        let mut findings = Vec::new();
        for (path, rule) in stylesheet_rules(&ctx.manifest)? {
            let Some((name, cycle, infinite)) = animation_of(&rule) else {
                continue;
            };
            if !infinite || cycle <= 0.0 || cycle >= MIN_SAFE_CYCLE_SECS {
                continue;
            }

            let frequency = 1.0 / cycle;
            let severity = if frequency >= 10.0 {
                Severity::Critical
            } else {
                Severity::High
            };
            findings.push(
                Finding::new(
                    self.name(),
                    Criterion::SeizureSafe,
                    normalize_selector(&rule.selector),
                    format!(
                        "Animation '{}' repeats at {:.1} Hz, above the 3 flashes per second limit",
                        name, frequency
                    ),
                )
                .with_severity(severity)
                .with_confidence(Confidence::High)
                .with_evidence(
                    Evidence::new(path)
                        .at_line(rule.line)
                        .with_metric("animation_type", name)
                        .with_metric("frequency", format!("{:.1}", frequency)),
                ),
            );
        }
        Ok(AgentOutput::new(findings))
    }
}

// ============================================================================
// LanguageAgent
// ============================================================================

/// Missing or malformed `lang` declarations
pub struct LanguageAgent {
    descriptor: AgentDescriptor,
}

impl LanguageAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new("LanguageAgent", &[Criterion::Language])
                .with_priority(40)
                .with_estimate(20),
        }
    }
}

impl Default for LanguageAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectorAgent for LanguageAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn is_applicable(&self, manifest: &Manifest) -> bool {
        manifest
            .entries_of(ArtifactKind::Markup)
            .any(|e| e.path.extension().is_some_and(|x| x != "qml" && x != "svg"))
    }

    async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
        let tag_re = Regex::new(r"^[a-zA-Z]{2,3}(-[a-zA-Z0-9]{2,8})*$")?;
        let mut findings = Vec::new();

        for entry in ctx.manifest.entries_of(ArtifactKind::Markup) {
            let content = ctx.manifest.read_to_string(entry)?;
            let path = entry.display_path();

            for tag in css::start_tags(&content)? {
                let is_root = tag.name == "html";
                let (lang_value, details) = match tag.attr("lang") {
                    None if is_root => ("missing".to_string(), "Document language is not declared".to_string()),
                    None => continue,
                    Some(None) | Some(Some("")) => (
                        "empty".to_string(),
                        "Language attribute is empty".to_string(),
                    ),
                    Some(Some(value)) if !tag_re.is_match(value.trim()) => (
                        value.to_string(),
                        format!("Language tag '{}' is not a valid BCP 47 tag", value),
                    ),
                    Some(Some(_)) => continue,
                };

                let scope = if is_root { "page" } else { "element" };
                let selector = if is_root { "html".to_string() } else { tag.selector() };
                findings.push(
                    Finding::new(self.name(), Criterion::Language, selector, details)
                        .with_severity(if is_root { Severity::High } else { Severity::Medium })
                        .with_confidence(Confidence::High)
                        .with_wcag(if is_root { "3.1.1" } else { "3.1.2" })
                        .with_evidence(
                            Evidence::new(path.clone())
                                .at_line(tag.line)
                                .with_metric("lang_value", lang_value)
                                .with_metric("scope", scope),
                        ),
                );
            }
        }
        Ok(AgentOutput::new(findings))
    }
}

// ============================================================================
// AriaAgent
// ============================================================================

/// Images without a text alternative and unknown ARIA roles
pub struct AriaAgent {
    descriptor: AgentDescriptor,
}

impl AriaAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new("AriaAgent", &[Criterion::Aria])
                .with_priority(70)
                .with_estimate(40),
        }
    }
}

impl Default for AriaAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectorAgent for AriaAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn is_applicable(&self, manifest: &Manifest) -> bool {
        manifest.has_kind(ArtifactKind::Markup)
    }

    async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
        let mut findings = Vec::new();

        for entry in ctx.manifest.entries_of(ArtifactKind::Markup) {
            let content = ctx.manifest.read_to_string(entry)?;
            let path = entry.display_path();

            for tag in css::start_tags(&content)? {
                if tag.name == "img" && tag.attr("alt").is_none() && tag.attr("aria-label").is_none() {
                    findings.push(
                        Finding::new(self.name(), Criterion::Aria, tag.selector(), "Image is missing alternative text")
                            .with_severity(Severity::High)
                            .with_confidence(Confidence::High)
                            .with_wcag("1.1.1")
                            .with_evidence(
                                Evidence::new(path.clone())
                                    .at_line(tag.line)
                                    .with_metric("role", "img")
                                    .with_metric("attribute", "alt"),
                            ),
                    );
                }

                if let Some(Some(role)) = tag.attr("role") {
                    let unknown: Vec<&str> = role
                        .split_whitespace()
                        .filter(|r| !KNOWN_ROLES.contains(&r.to_lowercase().as_str()))
                        .collect();
                    if let Some(first) = unknown.first() {
                        findings.push(
                            Finding::new(
                                self.name(),
                                Criterion::Aria,
                                format!("{}[role=\"{}\"]", tag.name, role),
                                format!("Invalid ARIA role: {}", first),
                            )
                            .with_severity(Severity::Medium)
                            .with_confidence(Confidence::High)
                            .with_evidence(
                                Evidence::new(path.clone())
                                    .at_line(tag.line)
                                    .with_metric("role", first.to_lowercase())
                                    .with_metric("attribute", "role"),
                            ),
                        );
                    }
                }
            }
        }
        Ok(AgentOutput::new(findings))
    }
}

// ============================================================================
// StateExplorerAgent
// ============================================================================

/// Focus styles that remove the outline without a replacement indicator.
///
/// Consumes ContrastAgent findings: selectors already reported there are
/// left to that agent.
pub struct StateExplorerAgent {
    descriptor: AgentDescriptor,
}

impl StateExplorerAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new("StateExplorerAgent", &[Criterion::StateExplorer])
                .depends_on("ContrastAgent")
                .with_priority(60)
                .with_estimate(50),
        }
    }
}

impl Default for StateExplorerAgent {
    fn default() -> Self {
        Self::new()
    }
}

fn removes_outline(rule: &CssRule) -> bool {
    let none = |v: &str| {
        let v = v.trim().to_lowercase();
        v == "none" || v == "0" || v.starts_with("none ") || v.starts_with("0 ")
    };
    let outline_removed = rule.get("outline").is_some_and(none) || rule.get("outline-style").is_some_and(none);
    let replaced = rule.get("box-shadow").is_some_and(|v| !none(v))
        || rule.get("border").is_some_and(|v| !none(v))
        || rule.get("text-decoration").is_some_and(|v| v.contains("underline"));
    outline_removed && !replaced
}

#[async_trait]
impl DetectorAgent for StateExplorerAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn is_applicable(&self, manifest: &Manifest) -> bool {
        manifest.has_kind(ArtifactKind::Stylesheet)
    }

    async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
        let reported: HashSet<&str> = ctx
            .upstream
            .iter()
            .filter(|f| f.criterion() == Criterion::Contrast)
            .map(|f| f.selector())
            .collect();

        let mut findings = Vec::new();
        for (path, rule) in stylesheet_rules(&ctx.manifest)? {
            if !rule.selector.contains(":focus") || !removes_outline(&rule) {
                continue;
            }
            let selector = normalize_selector(&rule.selector);
            if reported.contains(selector.as_str()) {
                tracing::debug!("{} already reported by ContrastAgent", selector);
                continue;
            }
            findings.push(
                Finding::new(
                    self.name(),
                    Criterion::StateExplorer,
                    selector,
                    "Focus state removes the outline without a visible replacement",
                )
                .with_state("focus")
                .with_severity(Severity::High)
                .with_confidence(Confidence::Medium)
                .with_evidence(Evidence::new(path).at_line(rule.line)),
            );
        }
        Ok(AgentOutput::new(findings))
    }
}

//! Detector Agents - the contract every detector implements
//!
//! A detector is a black box to the rest of the pipeline: it declares which
//! criteria it covers, which other agents' findings it consumes, and whether
//! it applies to a manifest. The plan builder and runtime only ever see
//! [`DetectorAgent`] trait objects held in an [`AgentRegistry`].

mod builtin;
mod css;

pub use builtin::{AriaAgent, ContrastAgent, LanguageAgent, SeizureSafeAgent, StateExplorerAgent};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Criterion, Finding, Manifest};

// ============================================================================
// Agent Descriptor
// ============================================================================

/// Static description of a detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub name: String,
    /// Criteria this agent can report on
    pub criteria: Vec<Criterion>,
    /// Names of agents whose findings this agent consumes
    pub depends_on: Vec<String>,
    /// Higher runs first within a parallel group
    pub priority: u32,
    /// Expected wall time, used only for plan estimates
    pub estimated_secs: u64,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, criteria: &[Criterion]) -> Self {
        Self {
            name: name.into(),
            criteria: criteria.to_vec(),
            depends_on: Vec::new(),
            priority: 50,
            estimated_secs: 30,
        }
    }

    pub fn depends_on(mut self, agent: impl Into<String>) -> Self {
        self.depends_on.push(agent.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, secs: u64) -> Self {
        self.estimated_secs = secs;
        self
    }

    pub fn covers(&self, criterion: Criterion) -> bool {
        self.criteria.contains(&criterion)
    }
}

/// Input handed to one agent invocation
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Shared, read-only artifact view
    pub manifest: Arc<Manifest>,
    /// Findings produced by this agent's declared dependencies
    pub upstream: Arc<Vec<Finding>>,
}

impl AgentContext {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self {
            manifest,
            upstream: Arc::new(Vec::new()),
        }
    }

    pub fn with_upstream(mut self, upstream: Vec<Finding>) -> Self {
        self.upstream = Arc::new(upstream);
        self
    }
}

/// What a successful detection returns
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub findings: Vec<Finding>,
    /// Usage counter for agents backed by a metered service
    pub tokens_used: Option<u64>,
}

impl AgentOutput {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            tokens_used: None,
        }
    }
}

// ============================================================================
// Detector Contract
// ============================================================================

#[async_trait]
pub trait DetectorAgent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    /// Applicability predicate over the manifest
    fn is_applicable(&self, manifest: &Manifest) -> bool;

    async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

// ============================================================================
// Agent Registry
// ============================================================================

/// Named set of detectors, iterated in name order
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn DetectorAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the five reference detectors
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ContrastAgent::new());
        registry.register(SeizureSafeAgent::new());
        registry.register(LanguageAgent::new());
        registry.register(AriaAgent::new());
        registry.register(StateExplorerAgent::new());
        registry
    }

    /// Register an agent, replacing any agent with the same name
    pub fn register<A: DetectorAgent + 'static>(&mut self, agent: A) -> &mut Self {
        self.register_arc(Arc::new(agent))
    }

    pub fn register_arc(&mut self, agent: Arc<dyn DetectorAgent>) -> &mut Self {
        let name = agent.name().to_string();
        if self.agents.insert(name.clone(), agent).is_some() {
            tracing::debug!("Replaced registered agent {}", name);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DetectorAgent>> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DetectorAgent>> {
        self.agents.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = AgentRegistry::with_builtin();
        assert_eq!(
            registry.names(),
            vec![
                "AriaAgent",
                "ContrastAgent",
                "LanguageAgent",
                "SeizureSafeAgent",
                "StateExplorerAgent"
            ]
        );
        let state = registry.get("StateExplorerAgent").unwrap();
        assert_eq!(state.descriptor().depends_on, vec!["ContrastAgent".to_string()]);
        assert!(state.descriptor().covers(Criterion::StateExplorer));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = AgentRegistry::new();
        registry.register(ContrastAgent::new());
        registry.register(ContrastAgent::with_threshold(7.0));
        assert_eq!(registry.len(), 1);
    }
}

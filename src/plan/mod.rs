//! Agent Plan Builder
//!
//! Turns a manifest and a registry into a layered execution plan:
//! - Eligible agents are those whose applicability predicate matches
//! - Kahn layering over the dependency graph gives the parallel groups
//! - Inside a group agents are ordered by priority (desc), then name (asc)
//!
//! Cycles are rejected, never broken.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentRegistry, DetectorAgent};
use crate::core::{Criterion, Manifest};
use crate::error::{Error, Result};

/// Fixed scheduling overhead added to every estimate
pub const PLAN_OVERHEAD_SECS: u64 = 30;

/// Layered schedule of detector agents for one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPlan {
    pub upload_id: String,
    /// Topologically valid execution order (groups flattened)
    pub agents: Vec<String>,
    /// Agents that may run concurrently, executed group after group
    pub parallel_groups: Vec<Vec<String>>,
    pub priorities: BTreeMap<String, u32>,
    /// In-plan dependencies per agent (ineligible dependencies dropped)
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub estimated_secs: u64,
}

impl AgentPlan {
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_secs)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.priorities.contains_key(agent)
    }

    /// Index of the group an agent runs in
    pub fn group_of(&self, agent: &str) -> Option<usize> {
        self.parallel_groups
            .iter()
            .position(|g| g.iter().any(|a| a == agent))
    }

    pub fn to_human_string(&self) -> String {
        let mut out = format!(
            "Plan for {}: {} agents in {} groups (est. {})\n",
            self.upload_id,
            self.agents.len(),
            self.parallel_groups.len(),
            humantime::format_duration(self.estimated_duration())
        );
        for (i, group) in self.parallel_groups.iter().enumerate() {
            out.push_str(&format!("  Group {}: {}\n", i + 1, group.join(", ")));
        }
        out
    }
}

/// Plan every applicable agent in the registry
pub fn build_plan(manifest: &Manifest, registry: &AgentRegistry) -> Result<AgentPlan> {
    let eligible: BTreeSet<String> = registry
        .iter()
        .filter(|a| a.is_applicable(manifest))
        .map(|a| a.name().to_string())
        .collect();

    layer(manifest.upload_id(), registry, &eligible)
}

/// Plan only the agents covering `criteria`, plus whatever they depend on
pub fn build_plan_for_criteria(
    manifest: &Manifest,
    registry: &AgentRegistry,
    criteria: &[Criterion],
) -> Result<AgentPlan> {
    let applicable = |a: &Arc<dyn DetectorAgent>| a.is_applicable(manifest);

    let mut eligible = BTreeSet::new();
    let mut queue: VecDeque<&Arc<dyn DetectorAgent>> = registry
        .iter()
        .filter(|a| applicable(*a))
        .filter(|a| criteria.iter().any(|c| a.descriptor().covers(*c)))
        .collect();

    while let Some(agent) = queue.pop_front() {
        if !eligible.insert(agent.name().to_string()) {
            continue;
        }
        for dep in &agent.descriptor().depends_on {
            match registry.get(dep) {
                Some(dep_agent) if applicable(dep_agent) => queue.push_back(dep_agent),
                Some(_) => {}
                None => {
                    return Err(Error::UnknownDependency {
                        agent: agent.name().to_string(),
                        dependency: dep.clone(),
                    })
                }
            }
        }
    }

    layer(manifest.upload_id(), registry, &eligible)
}

fn layer(upload_id: &str, registry: &AgentRegistry, eligible: &BTreeSet<String>) -> Result<AgentPlan> {
    if eligible.is_empty() {
        return Err(Error::NoEligibleAgents {
            upload_id: upload_id.to_string(),
        });
    }

    // Resolve in-plan edges
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut priorities = BTreeMap::new();
    let mut estimates = BTreeMap::new();
    for name in eligible {
        let Some(agent) = registry.get(name) else {
            continue;
        };
        let descriptor = agent.descriptor();
        let mut deps = BTreeSet::new();
        for dep in &descriptor.depends_on {
            if !registry.contains(dep) {
                return Err(Error::UnknownDependency {
                    agent: name.clone(),
                    dependency: dep.clone(),
                });
            }
            if eligible.contains(dep) {
                deps.insert(dep.as_str());
            } else {
                tracing::debug!("{}: dependency {} not applicable, treated as satisfied", name, dep);
            }
        }
        pending.insert(name.as_str(), deps);
        priorities.insert(name.clone(), descriptor.priority);
        estimates.insert(name.as_str(), descriptor.estimated_secs);
    }

    let dependencies: BTreeMap<String, Vec<String>> = pending
        .iter()
        .map(|(name, deps)| (name.to_string(), deps.iter().map(|d| d.to_string()).collect()))
        .collect();

    // Kahn layering: each round takes every agent whose deps are already placed
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut parallel_groups: Vec<Vec<String>> = Vec::new();
    while !pending.is_empty() {
        let mut ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| placed.contains(d)))
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            let agents: Vec<String> = pending.keys().map(|n| n.to_string()).collect();
            tracing::error!("Dependency cycle between agents: {}", agents.join(", "));
            return Err(Error::CyclicDependency { agents });
        }

        ready.sort_by(|a, b| priorities[*b].cmp(&priorities[*a]).then_with(|| a.cmp(b)));
        for name in &ready {
            pending.remove(name);
        }
        placed.extend(ready.iter().copied());
        parallel_groups.push(ready.into_iter().map(str::to_string).collect());
    }

    let estimated_secs = parallel_groups
        .iter()
        .map(|g| g.iter().map(|a| estimates[a.as_str()]).max().unwrap_or(0))
        .sum::<u64>()
        + PLAN_OVERHEAD_SECS;

    let plan = AgentPlan {
        upload_id: upload_id.to_string(),
        agents: parallel_groups.iter().flatten().cloned().collect(),
        parallel_groups,
        priorities,
        dependencies,
        estimated_secs,
    };

    tracing::info!(
        "Planned {} agents in {} groups for {}",
        plan.agents.len(),
        plan.parallel_groups.len(),
        upload_id
    );
    Ok(plan)
}

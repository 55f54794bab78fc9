//! Agent Runtime - executes an [`AgentPlan`] against a manifest
//!
//! The runtime:
//! - Runs parallel groups one after another (each group is a barrier)
//! - Runs agents inside a group concurrently, bounded by a semaphore
//! - Bounds every agent by a timeout; failures, timeouts and panics are
//!   recorded per agent and never cancel siblings
//! - Optionally bounds the whole plan, aborting what is still running
//!
//! Results are collected in plan order, so completion order never changes
//! the outcome.

mod events;
mod result;

pub use events::ProgressEvent;
pub use result::{AgentResult, RunOutcome, RunSummary};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc::UnboundedSender, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::agents::{AgentContext, AgentRegistry};
use crate::core::{Finding, Manifest};
use crate::error::{Error, Result};
use crate::plan::AgentPlan;
use events::EventSink;

// ============================================================================
// Runtime Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Agents allowed to run at once inside a group
    pub max_concurrent_agents: usize,
    pub agent_timeout: Duration,
    /// Bound on the whole run; `None` waits for every group
    pub plan_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: num_cpus::get().max(1),
            agent_timeout: Duration::from_secs(120),
            plan_timeout: None,
        }
    }
}

impl RuntimeConfig {
    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.max_concurrent_agents = max.max(1);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Agent Runtime
// ============================================================================

pub struct AgentRuntime {
    registry: AgentRegistry,
    config: RuntimeConfig,
    events: EventSink,
}

impl AgentRuntime {
    pub fn new(registry: AgentRegistry, config: RuntimeConfig) -> Self {
        Self {
            registry,
            config,
            events: EventSink::default(),
        }
    }

    /// Publish progress events on `tx` for every subsequent run
    pub fn with_events(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run every group of the plan.
    ///
    /// Fails only with [`Error::AllAgentsFailed`]; any single success makes
    /// the run successful.
    pub async fn run(&self, plan: &AgentPlan, manifest: Arc<Manifest>) -> Result<RunOutcome> {
        let started = Instant::now();
        let deadline = self
            .config
            .plan_timeout
            .map(|t| tokio::time::Instant::now() + t);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_agents.max(1)));

        info!(
            "Running {} agents in {} groups for {}",
            plan.agents.len(),
            plan.parallel_groups.len(),
            plan.upload_id
        );

        let mut results: BTreeMap<String, AgentResult> = BTreeMap::new();
        let mut partial = false;

        for (index, group) in plan.parallel_groups.iter().enumerate() {
            if partial {
                for name in group {
                    results.insert(
                        name.clone(),
                        AgentResult::failed(name, "plan timeout: agent not started", Duration::ZERO),
                    );
                    self.events.emit(ProgressEvent::AgentError {
                        agent: name.clone(),
                        error: "plan timeout: agent not started".to_string(),
                    });
                }
                continue;
            }

            debug!("Group {}: {}", index + 1, group.join(", "));
            let group_started = Instant::now();
            let handles = self.spawn_group(plan, index, group, &manifest, &semaphore, &results);

            // Barrier: every agent of the group resolves before the next starts
            for (name, mut handle) in handles {
                let joined = match deadline {
                    Some(deadline) if !partial => {
                        match tokio::time::timeout_at(deadline, &mut handle).await {
                            Ok(joined) => Some(joined),
                            Err(_) => {
                                warn!("Plan timeout reached, aborting outstanding agents");
                                partial = true;
                                None
                            }
                        }
                    }
                    _ if partial && !handle.is_finished() => None,
                    _ => Some((&mut handle).await),
                };

                let result = match joined {
                    Some(Ok(result)) => result,
                    Some(Err(e)) => self.join_failure(&name, e, group_started.elapsed()),
                    None => {
                        handle.abort();
                        let result = AgentResult::failed(
                            &name,
                            "plan timeout: agent cancelled",
                            group_started.elapsed(),
                        );
                        self.events.emit(ProgressEvent::AgentError {
                            agent: name.clone(),
                            error: "plan timeout: agent cancelled".to_string(),
                        });
                        result
                    }
                };
                results.insert(name, result);
            }
        }

        // Plan order, never completion order
        let ordered: Vec<AgentResult> = plan
            .agents
            .iter()
            .filter_map(|name| results.remove(name))
            .collect();

        let succeeded = ordered.iter().filter(|r| r.success).count();
        self.events.emit(ProgressEvent::PlanComplete {
            succeeded,
            failed: ordered.len() - succeeded,
            partial,
        });

        if succeeded == 0 {
            let failures: Vec<(String, String)> = ordered
                .iter()
                .map(|r| {
                    (
                        r.agent_name.clone(),
                        r.error_message.clone().unwrap_or_else(|| "unknown error".to_string()),
                    )
                })
                .collect();
            warn!("All {} agents failed for {}", failures.len(), plan.upload_id);
            return Err(Error::AllAgentsFailed { failures });
        }

        let findings = merge_findings(&ordered);
        let summary = result::summarize(&ordered, findings.len(), started.elapsed());

        info!(
            "Run complete for {}: {}/{} agents succeeded, {} findings{}",
            plan.upload_id,
            summary.agents_succeeded,
            summary.agents_scheduled,
            summary.unique_findings,
            if partial { " (partial)" } else { "" }
        );

        Ok(RunOutcome {
            upload_id: plan.upload_id.clone(),
            findings,
            results: ordered,
            partial,
            summary,
        })
    }

    fn spawn_group(
        &self,
        plan: &AgentPlan,
        index: usize,
        group: &[String],
        manifest: &Arc<Manifest>,
        semaphore: &Arc<Semaphore>,
        finished: &BTreeMap<String, AgentResult>,
    ) -> Vec<(String, JoinHandle<AgentResult>)> {
        let mut handles = Vec::with_capacity(group.len());

        for name in group {
            let Some(agent) = self.registry.get(name).cloned() else {
                let handle = tokio::spawn({
                    let name = name.clone();
                    async move { AgentResult::failed(name, "agent is not registered", Duration::ZERO) }
                });
                handles.push((name.clone(), handle));
                continue;
            };

            // Upstream findings come from successful dependencies only
            let upstream: Vec<Finding> = plan
                .dependencies
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|dep| finished.get(dep))
                .filter(|r| r.success)
                .flat_map(|r| r.findings.iter().cloned())
                .collect();
            let ctx = AgentContext::new(Arc::clone(manifest)).with_upstream(upstream);

            let semaphore = Arc::clone(semaphore);
            let events = self.events.clone();
            let timeout = self.config.agent_timeout;
            let name_clone = name.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return AgentResult::failed(name_clone, "runtime shut down", Duration::ZERO),
                };

                events.emit(ProgressEvent::AgentStart {
                    agent: name_clone.clone(),
                    group: index,
                });
                let agent_started = Instant::now();
                let outcome = tokio::time::timeout(timeout, agent.detect(ctx)).await;
                let elapsed = agent_started.elapsed();

                let result = match outcome {
                    Ok(Ok(output)) => {
                        AgentResult::succeeded(&name_clone, output.findings, elapsed).with_tokens(output.tokens_used)
                    }
                    Ok(Err(e)) => AgentResult::failed(&name_clone, format!("{:#}", e), elapsed),
                    Err(_) => AgentResult::failed(
                        &name_clone,
                        format!("timed out after {}", humantime::format_duration(timeout)),
                        elapsed,
                    ),
                };

                match &result.error_message {
                    None => events.emit(ProgressEvent::AgentComplete {
                        agent: name_clone,
                        findings: result.findings.len(),
                        wall_time_ms: result.wall_time_ms,
                    }),
                    Some(error) => {
                        warn!("Agent {} failed: {}", name_clone, error);
                        events.emit(ProgressEvent::AgentError {
                            agent: name_clone,
                            error: error.clone(),
                        })
                    }
                }
                result
            });

            handles.push((name.clone(), handle));
        }

        handles
    }

    fn join_failure(&self, name: &str, error: JoinError, elapsed: Duration) -> AgentResult {
        let message = if error.is_panic() {
            "agent panicked".to_string()
        } else {
            "agent task cancelled".to_string()
        };
        warn!("Agent {} failed: {}", name, message);
        self.events.emit(ProgressEvent::AgentError {
            agent: name.to_string(),
            error: message.clone(),
        });
        AgentResult::failed(name, message, elapsed)
    }
}

/// Findings of succeeding agents, sorted by id, first occurrence of an id kept
fn merge_findings(results: &[AgentResult]) -> Vec<Finding> {
    let mut findings: Vec<Finding> = results
        .iter()
        .filter(|r| r.success)
        .flat_map(|r| r.findings.iter().cloned())
        .collect();
    // stable sort keeps plan order among equal ids
    findings.sort_by(|a, b| a.id().cmp(b.id()));
    findings.dedup_by(|a, b| a.id() == b.id());
    findings
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentDescriptor, AgentOutput, DetectorAgent};
    use crate::core::Criterion;
    use crate::plan::build_plan;
    use async_trait::async_trait;

    enum Behavior {
        Emit(Vec<&'static str>),
        EchoUpstream,
        Fail(&'static str),
        Panic,
    }

    struct Scripted {
        descriptor: AgentDescriptor,
        delay: Duration,
        behavior: Behavior,
    }

    impl Scripted {
        fn new(name: &str, delay_ms: u64, behavior: Behavior) -> Self {
            Self {
                descriptor: AgentDescriptor::new(name, &[Criterion::Aria]),
                delay: Duration::from_millis(delay_ms),
                behavior,
            }
        }

        fn after(mut self, dep: &str) -> Self {
            self.descriptor = self.descriptor.depends_on(dep);
            self
        }
    }

    #[async_trait]
    impl DetectorAgent for Scripted {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        fn is_applicable(&self, _manifest: &Manifest) -> bool {
            true
        }

        async fn detect(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
            tokio::time::sleep(self.delay).await;
            let name = self.descriptor.name.as_str();
            match &self.behavior {
                Behavior::Emit(selectors) => Ok(AgentOutput::new(
                    selectors
                        .iter()
                        .map(|s| Finding::new(name, Criterion::Aria, *s, "scripted"))
                        .collect(),
                )),
                Behavior::EchoUpstream => Ok(AgentOutput::new(
                    ctx.upstream
                        .iter()
                        .map(|f| Finding::new(name, Criterion::Aria, f.selector(), "echo"))
                        .collect(),
                )),
                Behavior::Fail(msg) => anyhow::bail!("{}", msg),
                Behavior::Panic => panic!("scripted panic"),
            }
        }
    }

    fn manifest() -> Arc<Manifest> {
        Arc::new(Manifest::new("upload_rt", "/nonexistent", Vec::new()))
    }

    async fn run(agents: Vec<Scripted>, config: RuntimeConfig) -> Result<RunOutcome> {
        let mut registry = AgentRegistry::new();
        for a in agents {
            registry.register(a);
        }
        let manifest = manifest();
        let plan = build_plan(&manifest, &registry).unwrap();
        AgentRuntime::new(registry, config).run(&plan, manifest).await
    }

    #[tokio::test]
    async fn test_two_of_five_time_out() {
        let config = RuntimeConfig::default()
            .with_concurrency(5)
            .with_agent_timeout(Duration::from_millis(200));
        let outcome = run(
            vec![
                Scripted::new("A", 5, Behavior::Emit(vec!["a1", "a2"])),
                Scripted::new("B", 5, Behavior::Emit(vec!["b1"])),
                Scripted::new("C", 5, Behavior::Emit(vec!["c1"])),
                Scripted::new("Slow1", 10_000, Behavior::Emit(vec!["never"])),
                Scripted::new("Slow2", 10_000, Behavior::Emit(vec!["never"])),
            ],
            config,
        )
        .await
        .unwrap();

        assert_eq!(outcome.successful().count(), 3);
        let failed: Vec<&AgentResult> = outcome.failed().collect();
        assert_eq!(failed.len(), 2);
        for f in failed {
            assert!(f.error_message.as_deref().unwrap().contains("timed out"));
        }
        assert_eq!(outcome.findings.len(), 4);
        assert!(outcome.findings.iter().all(|f| f.agent() != "Slow1" && f.agent() != "Slow2"));
        assert!(!outcome.partial);
        assert_eq!(outcome.summary.agents_failed, 2);
    }

    #[tokio::test]
    async fn test_completion_order_does_not_matter() {
        let fast_first = run(
            vec![
                Scripted::new("A", 1, Behavior::Emit(vec!["x", "y"])),
                Scripted::new("B", 60, Behavior::Emit(vec!["z"])),
            ],
            RuntimeConfig::default(),
        )
        .await
        .unwrap();
        let slow_first = run(
            vec![
                Scripted::new("A", 60, Behavior::Emit(vec!["x", "y"])),
                Scripted::new("B", 1, Behavior::Emit(vec!["z"])),
            ],
            RuntimeConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(fast_first.findings, slow_first.findings);
        let names: Vec<&str> = slow_first.results.iter().map(|r| r.agent_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_failure_and_panic_are_isolated() {
        let outcome = run(
            vec![
                Scripted::new("Good", 1, Behavior::Emit(vec!["g"])),
                Scripted::new("Broken", 1, Behavior::Fail("parser exploded")),
                Scripted::new("Panicky", 1, Behavior::Panic),
            ],
            RuntimeConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(
            outcome.result_for("Broken").unwrap().error_message.as_deref(),
            Some("parser exploded")
        );
        assert_eq!(
            outcome.result_for("Panicky").unwrap().error_message.as_deref(),
            Some("agent panicked")
        );
    }

    #[tokio::test]
    async fn test_all_failed_is_surfaced() {
        let err = run(
            vec![
                Scripted::new("A", 1, Behavior::Fail("a broke")),
                Scripted::new("B", 1, Behavior::Fail("b broke")),
            ],
            RuntimeConfig::default(),
        )
        .await
        .unwrap_err();

        match err {
            Error::AllAgentsFailed { failures } => {
                assert_eq!(
                    failures,
                    vec![
                        ("A".to_string(), "a broke".to_string()),
                        ("B".to_string(), "b broke".to_string())
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dependency_findings_flow_downstream() {
        let outcome = run(
            vec![
                Scripted::new("Upstream", 1, Behavior::Emit(vec![".btn", ".nav"])),
                Scripted::new("Downstream", 1, Behavior::EchoUpstream).after("Upstream"),
            ],
            RuntimeConfig::default(),
        )
        .await
        .unwrap();

        let echoed = outcome.result_for("Downstream").unwrap();
        assert_eq!(echoed.findings.len(), 2);
        assert_eq!(outcome.findings.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_dependency_still_runs_dependents() {
        let outcome = run(
            vec![
                Scripted::new("Upstream", 1, Behavior::Fail("down")),
                Scripted::new("Downstream", 1, Behavior::EchoUpstream).after("Upstream"),
            ],
            RuntimeConfig::default(),
        )
        .await
        .unwrap();

        let downstream = outcome.result_for("Downstream").unwrap();
        assert!(downstream.success);
        assert!(downstream.findings.is_empty());
    }

    #[tokio::test]
    async fn test_plan_timeout_marks_partial() {
        let config = RuntimeConfig::default()
            .with_agent_timeout(Duration::from_secs(30))
            .with_plan_timeout(Duration::from_millis(300));
        let outcome = run(
            vec![
                Scripted::new("Fast", 1, Behavior::Emit(vec!["f"])),
                Scripted::new("Stuck", 20_000, Behavior::Emit(vec!["s"])),
                Scripted::new("Later", 1, Behavior::Emit(vec!["l"])).after("Fast"),
            ],
            config,
        )
        .await
        .unwrap();

        assert!(outcome.partial);
        assert!(outcome.result_for("Fast").unwrap().success);
        assert!(outcome
            .result_for("Stuck")
            .unwrap()
            .error_message
            .as_deref()
            .unwrap()
            .contains("cancelled"));
        assert!(outcome
            .result_for("Later")
            .unwrap()
            .error_message
            .as_deref()
            .unwrap()
            .contains("not started"));
        assert_eq!(outcome.findings.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = AgentRegistry::new();
        registry
            .register(Scripted::new("A", 1, Behavior::Emit(vec!["a"])))
            .register(Scripted::new("B", 1, Behavior::Fail("nope")));
        let manifest = manifest();
        let plan = build_plan(&manifest, &registry).unwrap();
        let runtime = AgentRuntime::new(registry, RuntimeConfig::default()).with_events(tx);
        runtime.run(&plan, manifest).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events.iter().filter(|e| matches!(e, ProgressEvent::AgentStart { .. })).count(),
            2
        );
        assert!(events.contains(&ProgressEvent::AgentError {
            agent: "B".to_string(),
            error: "nope".to_string()
        }));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::PlanComplete {
                succeeded: 1,
                failed: 1,
                partial: false
            })
        );
    }

    #[test]
    fn test_merge_findings_collapses_ids() {
        let dup = Finding::new("A", Criterion::Aria, "img", "first");
        let results = vec![
            AgentResult::succeeded("A", vec![dup.clone(), dup.with_severity(crate::core::Severity::High)], Duration::ZERO),
            AgentResult::failed("B", "x", Duration::ZERO),
        ];
        let merged = merge_findings(&results);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].severity(), crate::core::Severity::Medium);
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Finding;

/// Per-agent outcome of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    /// Raw output of the agent (empty on failure)
    pub findings: Vec<Finding>,
    pub wall_time_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub tokens_used: Option<u64>,
}

impl AgentResult {
    pub fn succeeded(agent_name: impl Into<String>, findings: Vec<Finding>, wall_time: Duration) -> Self {
        Self {
            agent_name: agent_name.into(),
            findings,
            wall_time_ms: wall_time.as_millis() as u64,
            success: true,
            error_message: None,
            tokens_used: None,
        }
    }

    pub fn failed(agent_name: impl Into<String>, error: impl Into<String>, wall_time: Duration) -> Self {
        Self {
            agent_name: agent_name.into(),
            findings: Vec::new(),
            wall_time_ms: wall_time.as_millis() as u64,
            success: false,
            error_message: Some(error.into()),
            tokens_used: None,
        }
    }

    pub fn with_tokens(mut self, tokens: Option<u64>) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }
}

/// Aggregate counters for a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub agents_scheduled: usize,
    pub agents_succeeded: usize,
    pub agents_failed: usize,
    pub findings_produced: usize,
    pub unique_findings: usize,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
}

/// Everything a plan run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub upload_id: String,
    /// Findings of succeeding agents, sorted by id, identical ids collapsed
    pub findings: Vec<Finding>,
    /// One result per planned agent, in plan order
    pub results: Vec<AgentResult>,
    /// Set when the plan-level timeout cut the run short
    pub partial: bool,
    pub summary: RunSummary,
}

impl RunOutcome {
    pub fn successful(&self) -> impl Iterator<Item = &AgentResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &AgentResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn result_for(&self, agent: &str) -> Option<&AgentResult> {
        self.results.iter().find(|r| r.agent_name == agent)
    }

    pub fn to_human_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run for {}\n", self.upload_id));
        out.push_str(&format!(
            "  Agents: {} succeeded, {} failed of {}{}\n",
            self.summary.agents_succeeded,
            self.summary.agents_failed,
            self.summary.agents_scheduled,
            if self.partial { " (partial)" } else { "" }
        ));
        out.push_str(&format!(
            "  Findings: {} ({} raw)\n",
            self.summary.unique_findings, self.summary.findings_produced
        ));
        out.push_str(&format!(
            "  Elapsed: {}\n",
            humantime::format_duration(Duration::from_millis(self.summary.elapsed_ms))
        ));
        for failed in self.failed() {
            out.push_str(&format!(
                "  ✗ {}: {}\n",
                failed.agent_name,
                failed.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
        out
    }
}

/// Counters derived from the per-agent results
pub(crate) fn summarize(results: &[AgentResult], unique_findings: usize, elapsed: Duration) -> RunSummary {
    let succeeded: Vec<&AgentResult> = results.iter().filter(|r| r.success).collect();
    RunSummary {
        agents_scheduled: results.len(),
        agents_succeeded: succeeded.len(),
        agents_failed: results.len() - succeeded.len(),
        findings_produced: succeeded.iter().map(|r| r.findings.len()).sum(),
        unique_findings,
        tokens_used: results.iter().filter_map(|r| r.tokens_used).sum(),
        elapsed_ms: elapsed.as_millis() as u64,
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Live progress of a plan run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    AgentStart {
        agent: String,
        group: usize,
    },
    AgentComplete {
        agent: String,
        findings: usize,
        wall_time_ms: u64,
    },
    AgentError {
        agent: String,
        error: String,
    },
    PlanComplete {
        succeeded: usize,
        failed: usize,
        partial: bool,
    },
}

impl ProgressEvent {
    pub fn agent(&self) -> Option<&str> {
        match self {
            ProgressEvent::AgentStart { agent, .. }
            | ProgressEvent::AgentComplete { agent, .. }
            | ProgressEvent::AgentError { agent, .. } => Some(agent),
            ProgressEvent::PlanComplete { .. } => None,
        }
    }
}

/// Optional event sink; sending never fails the run
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink(Option<UnboundedSender<ProgressEvent>>);

impl EventSink {
    pub fn new(tx: Option<UnboundedSender<ProgressEvent>>) -> Self {
        Self(tx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.0 {
            // receiver gone means nobody is listening
            let _ = tx.send(event);
        }
    }
}

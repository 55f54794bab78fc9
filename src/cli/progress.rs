//! Renders runtime progress events as an indicatif bar

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::runtime::ProgressEvent;

pub struct ProgressRenderer {
    handle: JoinHandle<()>,
}

impl ProgressRenderer {
    /// Consume `rx` until the first `plan_complete` or until the sender is dropped
    pub fn spawn(mut rx: UnboundedReceiver<ProgressEvent>, total: u64) -> anyhow::Result<Self> {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("█▓▒░"),
        );
        pb.enable_steady_tick(Duration::from_millis(80));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ProgressEvent::AgentStart { agent, group } => {
                        pb.set_message(format!("{} (group {})", agent, group));
                    }
                    ProgressEvent::AgentComplete { agent, findings, wall_time_ms } => {
                        pb.inc(1);
                        pb.println(format!(
                            "  {} {} {} findings in {}",
                            "✓".bright_green(),
                            agent,
                            findings,
                            humantime::format_duration(Duration::from_millis(wall_time_ms))
                        ));
                    }
                    ProgressEvent::AgentError { agent, error } => {
                        pb.inc(1);
                        pb.println(format!("  {} {} {}", "✗".red(), agent, error.red()));
                    }
                    ProgressEvent::PlanComplete { succeeded, failed, partial } => {
                        let note = if partial { " (partial)" } else { "" };
                        pb.finish_with_message(format!("{} ok, {} failed{}", succeeded, failed, note));
                        break;
                    }
                }
            }
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        });

        Ok(Self { handle })
    }

    pub async fn finish(self) {
        let _ = self.handle.await;
    }
}

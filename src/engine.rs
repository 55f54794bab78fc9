//! Evaluator - the whole pipeline behind one value
//!
//! manifest → plan → run → cluster, then patches → sandbox → recheck.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::agents::AgentRegistry;
use crate::cluster::{ClusterStore, ClusteringResult};
use crate::config::Config;
use crate::core::Manifest;
use crate::error::Result;
use crate::plan::{build_plan, AgentPlan};
use crate::runtime::{AgentRuntime, ProgressEvent, RunOutcome};
use crate::sandbox::{Patch, PatchOutcome, PatchSummary, RecheckResult, RecheckScope, SandboxManager};
use crate::synth::{ClusterDigest, PatchSynthesizer};

/// Findings and clusters of one evaluation pass
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub plan: AgentPlan,
    pub run: RunOutcome,
    pub clustering: ClusteringResult,
}

impl Evaluation {
    pub fn upload_id(&self) -> &str {
        &self.plan.upload_id
    }

    pub fn digests(&self) -> Vec<ClusterDigest> {
        self.clustering.clusters.iter().map(ClusterDigest::from).collect()
    }
}

/// Outcome of applying a batch and re-running detection
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub outcomes: Vec<PatchOutcome>,
    pub summary: PatchSummary,
    pub recheck: RecheckResult,
    /// True when every original still matches its recorded digest
    pub originals_intact: bool,
    /// Originals that no longer match, relative to the upload root
    pub originals_changed: Vec<PathBuf>,
    pub sandbox_id: String,
    pub sandbox_dir: PathBuf,
}

pub struct EvaluatorBuilder {
    config: Config,
    registry: AgentRegistry,
    events: Option<UnboundedSender<ProgressEvent>>,
}

impl EvaluatorBuilder {
    pub fn registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn events(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Evaluator {
        let mut runtime = AgentRuntime::new(self.registry, self.config.runtime.to_runtime_config());
        if let Some(tx) = self.events {
            runtime = runtime.with_events(tx);
        }
        let runtime = Arc::new(runtime);
        let sandboxes = SandboxManager::new(&self.config.sandbox.root, runtime.clone())
            .with_verify_originals(self.config.sandbox.verify_originals);

        Evaluator {
            config: self.config,
            runtime,
            clusters: ClusterStore::new(),
            sandboxes,
            cycles: parking_lot::Mutex::new(HashMap::new()),
            reclaimed: AtomicBool::new(false),
        }
    }
}

pub struct Evaluator {
    config: Config,
    runtime: Arc<AgentRuntime>,
    clusters: ClusterStore,
    sandboxes: SandboxManager,
    /// One lock per upload, held for a whole verification cycle
    cycles: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    reclaimed: AtomicBool,
}

impl Evaluator {
    /// Built-in detectors, no progress channel
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> EvaluatorBuilder {
        EvaluatorBuilder {
            config,
            registry: AgentRegistry::with_builtin(),
            events: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn clusters(&self) -> &ClusterStore {
        &self.clusters
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn plan(&self, manifest: &Manifest) -> Result<AgentPlan> {
        build_plan(manifest, self.runtime.registry())
    }

    /// Plan, run, and cluster; the clusters replace the upload's previous ones
    pub async fn evaluate(&self, manifest: Arc<Manifest>) -> Result<Evaluation> {
        let plan = self.plan(&manifest)?;
        let run = self.runtime.run(&plan, manifest.clone()).await?;
        let clustering = self.clusters.cluster(
            manifest.upload_id(),
            &run.findings,
            self.config.clustering.method,
            self.config.clustering.similarity_threshold,
        )?;

        info!(
            "Evaluated {}: {} findings in {} clusters",
            manifest.upload_id(),
            clustering.total_findings,
            clustering.clusters.len()
        );
        Ok(Evaluation { plan, run, clustering })
    }

    /// Fresh sandbox, apply `patches`, recheck against the evaluation's
    /// findings. The sandbox stays active until `cleanup`.
    ///
    /// Cycles for the same upload run one after another; each one works on
    /// the sandbox it created. The first call also removes sandbox
    /// directories an earlier process left under the root.
    pub async fn verify(
        &self,
        manifest: Arc<Manifest>,
        evaluation: &Evaluation,
        patches: &[Patch],
        scope: RecheckScope,
    ) -> Result<Verification> {
        if !self.reclaimed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.sandboxes.reclaim_orphans().await {
                warn!("Could not reclaim orphaned sandboxes: {}", e);
            }
        }

        let cycle = self.cycle_lock(manifest.upload_id());
        let _cycle = cycle.lock().await;

        let sandbox = self.sandboxes.create_sandbox(manifest).await?;
        let batch = self.sandboxes.apply_patches(&sandbox, patches).await?;
        let recheck = self
            .sandboxes
            .recheck(&sandbox, &evaluation.run.findings, scope)
            .await?;

        let mut originals_changed = self.sandboxes.verify_originals(&sandbox);
        for path in batch.originals_changed {
            if !originals_changed.contains(&path) {
                originals_changed.push(path);
            }
        }
        originals_changed.sort();

        Ok(Verification {
            outcomes: batch.outcomes,
            summary: batch.summary,
            recheck,
            originals_intact: originals_changed.is_empty(),
            originals_changed,
            sandbox_id: sandbox.id().to_string(),
            sandbox_dir: sandbox.dir().to_path_buf(),
        })
    }

    fn cycle_lock(&self, upload_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.cycles.lock().entry(upload_id.to_string()).or_default().clone()
    }

    /// Ask `synthesizer` for patches covering every cluster, then verify them
    pub async fn synthesize_and_verify(
        &self,
        manifest: Arc<Manifest>,
        evaluation: &Evaluation,
        synthesizer: &dyn PatchSynthesizer,
        scope: RecheckScope,
    ) -> anyhow::Result<Verification> {
        let patches = synthesizer.synthesize(&evaluation.digests()).await?;
        info!("{} proposed {} patches", synthesizer.name(), patches.len());
        Ok(self.verify(manifest, evaluation, &patches, scope).await?)
    }

    pub async fn cleanup(&self, upload_id: &str) -> bool {
        {
            // drop the cycle lock once no verification holds it
            let mut cycles = self.cycles.lock();
            if cycles.get(upload_id).is_some_and(|c| Arc::strong_count(c) == 1) {
                cycles.remove(upload_id);
            }
        }
        self.sandboxes.cleanup(upload_id).await
    }
}

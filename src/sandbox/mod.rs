//! Sandbox Verifier - apply patches to a private copy and re-run detection
//!
//! Lifecycle per upload:
//! 1. `create_sandbox` copies every manifest file into
//!    `<root>/sandbox_<upload>_<uuid>/` and records blake3 digests of the
//!    originals
//! 2. `apply_patches` writes only inside that directory
//! 3. `recheck` runs the agent runtime against the sandbox snapshot and
//!    compares by finding identity
//! 4. `cleanup` (or a new `create_sandbox` for the same upload) retires it
//!
//! Apply and recheck take the handle `create_sandbox` returned, never an
//! upload id, so a cycle only ever touches its own copy. Once a handle is
//! retired or replaced they fail with `SandboxNotFound`. Operations on one
//! sandbox are queued behind an async mutex, so an apply and a recheck on
//! the same handle never interleave.

mod compare;
mod diff;
mod patch;
mod validate;

pub use compare::{compare, RecheckResult};
pub use diff::{apply_diff, apply_unified_diff, parse_unified_diff, DiffHunk, DiffLine, UnifiedDiff};
pub use patch::{Patch, PatchApplicationError, PatchOutcome, PatchPayload, PatchSafety, PatchSummary, PatchType};
pub use validate::{validate, validate_markup, validate_stylesheet};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use humansize::{format_size, BINARY};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::{Criterion, Finding, Manifest};
use crate::error::{Error, Result};
use crate::plan::{build_plan, build_plan_for_criteria};
use crate::readonly::{safe_copy, ChecksumLedger, WriteGuard};
use crate::runtime::AgentRuntime;

const DIR_PREFIX: &str = "sandbox_";

/// Which agents a recheck runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecheckScope {
    /// Every applicable agent
    #[default]
    Full,
    /// Only agents covering the criteria of applied patches (plus their
    /// dependencies); falls back to `Full` when any applied patch has no
    /// criterion
    Touched,
}

impl FromStr for RecheckScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(RecheckScope::Full),
            "touched" | "scoped" => Ok(RecheckScope::Touched),
            other => Err(format!("unknown recheck scope: {other}")),
        }
    }
}

/// What one `apply_patches` call did
#[derive(Debug, Clone, Serialize)]
pub struct PatchBatch {
    pub outcomes: Vec<PatchOutcome>,
    pub summary: PatchSummary,
    /// Originals whose content no longer matches the digest recorded at
    /// creation; always empty when original verification is off
    pub originals_changed: Vec<PathBuf>,
}

impl PatchBatch {
    pub fn originals_intact(&self) -> bool {
        self.originals_changed.is_empty()
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    applied: Vec<Patch>,
    retired: bool,
}

/// One upload's private working copy
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    upload_id: String,
    dir: PathBuf,
    original: Arc<Manifest>,
    snapshot: Arc<Manifest>,
    guard: WriteGuard,
    ledger: ChecksumLedger,
    state: tokio::sync::Mutex<SandboxState>,
}

impl Sandbox {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Manifest served from the sandbox copy
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.snapshot
    }

    pub fn checksums(&self) -> &ChecksumLedger {
        &self.ledger
    }

    /// Patches applied successfully so far, in application order
    pub async fn applied_patches(&self) -> Vec<Patch> {
        self.state.lock().await.applied.clone()
    }

    /// Wait for in-flight work, then delete the directory
    async fn retire(&self) {
        let mut state = self.state.lock().await;
        if state.retired {
            return;
        }
        state.retired = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!("Removed sandbox {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove sandbox {}: {}", self.dir.display(), e),
        }
    }
}

pub struct SandboxManager {
    root: PathBuf,
    runtime: Arc<AgentRuntime>,
    verify_originals: bool,
    live: parking_lot::Mutex<HashMap<String, Arc<Sandbox>>>,
    /// Held shared while a sandbox directory is being populated, exclusively
    /// while orphans are reclaimed
    reclaim_gate: tokio::sync::RwLock<()>,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>, runtime: Arc<AgentRuntime>) -> Self {
        Self {
            root: root.into(),
            runtime,
            verify_originals: true,
            live: parking_lot::Mutex::new(HashMap::new()),
            reclaim_gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Re-check original checksums after every apply (on by default)
    pub fn with_verify_originals(mut self, enabled: bool) -> Self {
        self.verify_originals = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn get(&self, upload_id: &str) -> Result<Arc<Sandbox>> {
        self.live
            .lock()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| Error::SandboxNotFound {
                upload_id: upload_id.to_string(),
            })
    }

    pub fn is_active(&self, upload_id: &str) -> bool {
        self.live.lock().contains_key(upload_id)
    }

    /// `sandbox` is still the upload's live sandbox and not yet retired
    fn ensure_current(&self, sandbox: &Sandbox, state: &SandboxState) -> Result<()> {
        let current = self
            .live
            .lock()
            .get(&sandbox.upload_id)
            .map_or(false, |live| live.id == sandbox.id);
        if state.retired || !current {
            return Err(Error::SandboxNotFound {
                upload_id: sandbox.upload_id.clone(),
            });
        }
        Ok(())
    }

    /// Copy the upload's artifacts into a fresh sandbox.
    ///
    /// A previous sandbox for the same upload is detached at once and
    /// removed in the background after its current operation finishes.
    pub async fn create_sandbox(&self, manifest: Arc<Manifest>) -> Result<Arc<Sandbox>> {
        let upload_id = manifest.upload_id().to_string();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self
            .root
            .join(format!("{}{}_{}", DIR_PREFIX, sanitize(&upload_id), id));

        let _populating = self.reclaim_gate.read().await;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| Error::io(&dir, e))?;

        let populate = {
            let manifest = manifest.clone();
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || populate(&manifest, &dir))
        };
        let populated = match populate.await {
            Ok(result) => result,
            Err(join) => Err(Error::io(&dir, std::io::Error::other(join.to_string()))),
        };
        let (guard, ledger, bytes) = match populated {
            Ok(parts) => parts,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        let sandbox = Arc::new(Sandbox {
            id,
            upload_id: upload_id.clone(),
            snapshot: Arc::new(manifest.rebased(guard.workspace())),
            dir,
            original: manifest,
            guard,
            ledger,
            state: tokio::sync::Mutex::new(SandboxState::default()),
        });

        let previous = self.live.lock().insert(upload_id.clone(), sandbox.clone());
        if let Some(previous) = previous {
            info!("Replacing sandbox {} for {}", previous.id, upload_id);
            tokio::spawn(async move { previous.retire().await });
        }

        info!(
            "Created sandbox {} for {} ({} files, {})",
            sandbox.id,
            upload_id,
            sandbox.snapshot.len(),
            format_size(bytes, BINARY)
        );
        Ok(sandbox)
    }

    /// Apply each patch independently; failures are reported per patch
    pub async fn apply_patches(&self, sandbox: &Sandbox, patches: &[Patch]) -> Result<PatchBatch> {
        let mut state = sandbox.state.lock().await;
        self.ensure_current(sandbox, &state)?;

        let task = {
            let guard = sandbox.guard.clone();
            let batch = patches.to_vec();
            tokio::task::spawn_blocking(move || batch.iter().map(|p| patch::apply_one(&guard, p)).collect::<Vec<_>>())
        };
        let outcomes = task
            .await
            .map_err(|e| Error::io(&sandbox.dir, std::io::Error::other(e.to_string())))?;

        for (patch, outcome) in patches.iter().zip(&outcomes) {
            if outcome.applied {
                state.applied.push(patch.clone());
            }
        }

        let summary = PatchSummary::of(&outcomes);
        info!(
            "Applied {}/{} patches in sandbox {} ({} safe, {} risky)",
            summary.applied, summary.total, sandbox.id, summary.safe, summary.risky
        );

        let originals_changed = if self.verify_originals {
            sandbox.ledger.changed(&sandbox.original)
        } else {
            Vec::new()
        };
        if !originals_changed.is_empty() {
            error!("Original artifacts changed during patching: {:?}", originals_changed);
        }
        Ok(PatchBatch {
            outcomes,
            summary,
            originals_changed,
        })
    }

    /// Re-run detection on the sandbox and compare with `before`
    pub async fn recheck(&self, sandbox: &Sandbox, before: &[Finding], scope: RecheckScope) -> Result<RecheckResult> {
        let state = sandbox.state.lock().await;
        self.ensure_current(sandbox, &state)?;
        let upload_id = sandbox.upload_id.as_str();

        let criteria = match scope {
            RecheckScope::Full => None,
            RecheckScope::Touched => touched_criteria(&state.applied),
        };
        let registry = self.runtime.registry();
        let plan = match &criteria {
            Some(c) => build_plan_for_criteria(&sandbox.snapshot, registry, &c.iter().copied().collect::<Vec<_>>())?,
            None => build_plan(&sandbox.snapshot, registry)?,
        };
        debug!("Recheck plan for {}: {:?}", upload_id, plan.agents);

        let outcome = self.runtime.run(&plan, sandbox.snapshot.clone()).await?;

        // dependencies run too, but only the scoped criteria are compared
        let scoped = |findings: &[Finding]| -> Vec<Finding> {
            match &criteria {
                Some(c) => findings.iter().filter(|f| c.contains(&f.criterion())).cloned().collect(),
                None => findings.to_vec(),
            }
        };
        let result = compare(upload_id, &scoped(before), &scoped(&outcome.findings));
        info!(
            "Recheck for {}: {} fixed, {} new, {} remaining ({:.1}%)",
            upload_id, result.fixed_findings, result.new_findings, result.remaining_findings, result.success_rate
        );
        Ok(result)
    }

    /// Relative paths of originals whose content no longer matches the
    /// digests recorded at creation
    pub fn verify_originals(&self, sandbox: &Sandbox) -> Vec<PathBuf> {
        sandbox.ledger.changed(&sandbox.original)
    }

    /// Destroy the upload's sandbox. Returns false when there was none.
    pub async fn cleanup(&self, upload_id: &str) -> bool {
        let removed = self.live.lock().remove(upload_id);
        match removed {
            Some(sandbox) => {
                sandbox.retire().await;
                info!("Cleaned up sandbox {} for {}", sandbox.id, upload_id);
                true
            }
            None => false,
        }
    }

    /// Delete sandbox directories under the root that no live sandbox owns
    /// (left behind by a previous process)
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let _exclusive = self.reclaim_gate.write().await;
        let live: BTreeSet<PathBuf> = self.live.lock().values().map(|s| s.dir.clone()).collect();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(&self.root, e)),
        };

        let mut reclaimed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&self.root, e))? {
            let path = entry.path();
            let is_sandbox = entry.file_name().to_string_lossy().starts_with(DIR_PREFIX);
            if !is_sandbox || live.contains(&path) || !path.is_dir() {
                continue;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!("Could not reclaim {}: {}", path.display(), e),
            }
        }
        if reclaimed > 0 {
            info!("Reclaimed {} orphaned sandboxes under {}", reclaimed, self.root.display());
        }
        Ok(reclaimed)
    }
}

/// Copy every manifest file into `dir`, returning the guard, the digests of
/// the originals and the bytes copied
fn populate(manifest: &Manifest, dir: &Path) -> Result<(WriteGuard, ChecksumLedger, u64)> {
    let guard = WriteGuard::new(manifest.root(), dir).map_err(|e| Error::io(dir, e))?;
    let ledger = ChecksumLedger::record(manifest).map_err(|e| Error::io(manifest.root(), e))?;

    let mut bytes = 0;
    for entry in manifest.entries() {
        let source = manifest.absolute_path(entry);
        let dest = guard.resolve(&entry.path).map_err(|e| Error::io(&entry.path, e))?;
        bytes += safe_copy(&source, &dest, &guard).map_err(|e| Error::io(&source, e))?;
    }
    Ok((guard, ledger, bytes))
}

fn touched_criteria(applied: &[Patch]) -> Option<BTreeSet<Criterion>> {
    if applied.is_empty() {
        return None;
    }
    applied.iter().map(|p| p.criterion).collect()
}

fn sanitize(upload_id: &str) -> String {
    upload_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::runtime::RuntimeConfig;
    use tempfile::TempDir;

    fn manager(root: &Path) -> SandboxManager {
        let runtime = AgentRuntime::new(AgentRegistry::with_builtin(), RuntimeConfig::default());
        SandboxManager::new(root, Arc::new(runtime))
    }

    fn upload() -> (TempDir, Arc<Manifest>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html><body><img src=\"a.png\"></body></html>\n").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/app.css"), ".btn { color: #777777; background: #ffffff; }\n").unwrap();
        let manifest = Manifest::scan("upload-1", dir.path()).unwrap();
        (dir, Arc::new(manifest))
    }

    #[test]
    fn test_touched_criteria() {
        assert_eq!(touched_criteria(&[]), None);
        let p = Patch::new(PatchType::CssUpdate, "a.css", "x");
        assert_eq!(touched_criteria(&[p.clone()]), None);
        let scoped = p.for_cluster("cluster_1", Criterion::Contrast);
        assert_eq!(touched_criteria(&[scoped]), Some(BTreeSet::from([Criterion::Contrast])));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("up/../load 1"), "up____load_1");
    }

    #[tokio::test]
    async fn test_create_copies_and_replaces() {
        let (_src, manifest) = upload();
        let root = TempDir::new().unwrap();
        let mgr = manager(root.path());

        assert!(matches!(mgr.get("upload-1"), Err(Error::SandboxNotFound { .. })));

        let first = mgr.create_sandbox(manifest.clone()).await.unwrap();
        assert!(first.dir().join("css/app.css").is_file());
        assert_eq!(first.checksums().len(), 2);
        assert!(first.dir().file_name().unwrap().to_string_lossy().starts_with("sandbox_upload-1_"));

        let second = mgr.create_sandbox(manifest).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(mgr.get("upload-1").unwrap().id(), second.id());

        // the replaced sandbox is retired in the background
        first.retire().await;
        assert!(!first.dir().exists());
        assert!(second.dir().exists());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (_src, manifest) = upload();
        let root = TempDir::new().unwrap();
        let mgr = manager(root.path());

        let sandbox = mgr.create_sandbox(manifest).await.unwrap();
        assert!(mgr.cleanup("upload-1").await);
        assert!(!sandbox.dir().exists());
        assert!(!mgr.cleanup("upload-1").await);
        assert!(matches!(
            mgr.apply_patches(&sandbox, &[]).await,
            Err(Error::SandboxNotFound { .. })
        ));
        assert!(matches!(
            mgr.recheck(&sandbox, &[], RecheckScope::Full).await,
            Err(Error::SandboxNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_replaced_handle_is_rejected() {
        let (_src, manifest) = upload();
        let root = TempDir::new().unwrap();
        let mgr = manager(root.path());

        let first = mgr.create_sandbox(manifest.clone()).await.unwrap();
        let second = mgr.create_sandbox(manifest).await.unwrap();

        let fix = Patch::new(PatchType::HtmlUpdate, "index.html", "<html><body><img src=\"a.png\" alt=\"A\"></body></html>\n");
        assert!(matches!(
            mgr.apply_patches(&first, &[fix.clone()]).await,
            Err(Error::SandboxNotFound { .. })
        ));

        let batch = mgr.apply_patches(&second, &[fix]).await.unwrap();
        assert_eq!(batch.summary.applied, 1);
        assert!(batch.originals_intact());
        assert_eq!(second.applied_patches().await.len(), 1);
        assert!(first.applied_patches().await.is_empty());
    }

    #[tokio::test]
    async fn test_changed_original_reported_in_batch() {
        let (src, manifest) = upload();
        let root = TempDir::new().unwrap();
        let mgr = manager(root.path());

        let sandbox = mgr.create_sandbox(manifest).await.unwrap();
        std::fs::write(src.path().join("css/app.css"), ".btn { color: #000000; }\n").unwrap();

        let css = Patch::new(PatchType::CssUpdate, "css/app.css", ".btn { color: #595959; background: #ffffff; }\n");
        let batch = mgr.apply_patches(&sandbox, &[css]).await.unwrap();
        assert_eq!(batch.summary.applied, 1);
        assert!(!batch.originals_intact());
        assert_eq!(batch.originals_changed, vec![PathBuf::from("css/app.css")]);
        assert_eq!(mgr.verify_originals(&sandbox), batch.originals_changed);

        let unchecked = manager(root.path()).with_verify_originals(false);
        let other = unchecked.create_sandbox(Arc::new(Manifest::scan("upload-1", src.path()).unwrap())).await.unwrap();
        std::fs::write(src.path().join("index.html"), "<html></html>\n").unwrap();
        assert!(unchecked.apply_patches(&other, &[]).await.unwrap().originals_intact());
    }

    #[tokio::test]
    async fn test_reclaim_orphans() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("sandbox_old_abc")).unwrap();
        std::fs::create_dir(root.path().join("keep_me")).unwrap();
        let mgr = manager(root.path());

        let (_src, manifest) = upload();
        let live = mgr.create_sandbox(manifest).await.unwrap();

        assert_eq!(mgr.reclaim_orphans().await.unwrap(), 1);
        assert!(root.path().join("keep_me").exists());
        assert!(!root.path().join("sandbox_old_abc").exists());
        assert!(live.dir().exists());
    }
}

//! Read-Only Enforcement Module
//!
//! Guards that keep the original artifacts untouched:
//! - Originals are only ever opened through [`open_readonly`]
//! - Sandbox writes go through a [`WriteGuard`] that refuses any target
//!   inside the protected artifact root
//! - A [`ChecksumLedger`] records blake3 digests at sandbox creation so the
//!   originals can be re-verified after patching

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::core::Manifest;

// ============================================================================
// Safe File Opening
// ============================================================================

/// Open a file for reading only.
///
/// Every read of an original artifact goes through here; nothing in this
/// crate opens an original with write, append, truncate or create flags.
pub fn open_readonly(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Blake3 of a file's content (streaming, 8 KB buffer)
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = open_readonly(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

// ============================================================================
// Write Guard
// ============================================================================

/// Confines writes to a working area and away from a protected root
#[derive(Debug, Clone)]
pub struct WriteGuard {
    protected: PathBuf,
    workspace: PathBuf,
}

impl WriteGuard {
    /// `protected` is the original artifact root, `workspace` the only
    /// directory writes may land in. Both must exist.
    pub fn new(protected: &Path, workspace: &Path) -> io::Result<Self> {
        Ok(Self {
            protected: protected.canonicalize()?,
            workspace: workspace.canonicalize()?,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve a relative artifact path to a writable location.
    ///
    /// Rejects absolute paths, `..` components, and anything that would
    /// resolve inside the protected root.
    pub fn resolve(&self, relative: &Path) -> io::Result<PathBuf> {
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("path escapes the sandbox: {}", relative.display()),
            ));
        }

        let target = self.workspace.join(relative);
        self.check(&target)?;
        Ok(target)
    }

    /// Verify an absolute target is inside the workspace and outside the
    /// protected root (symlinks resolved through the nearest existing parent)
    pub fn check(&self, target: &Path) -> io::Result<()> {
        let resolved = resolve_existing_prefix(target)?;

        if resolved.starts_with(&self.protected) {
            tracing::error!(
                "READONLY VIOLATION: write to {} refused (inside {})",
                resolved.display(),
                self.protected.display()
            );
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("write into original artifacts refused: {}", target.display()),
            ));
        }
        if !resolved.starts_with(&self.workspace) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("write outside the sandbox refused: {}", target.display()),
            ));
        }
        Ok(())
    }

    /// Write content to a checked target
    pub fn write(&self, target: &Path, content: &[u8]) -> io::Result<()> {
        self.check(target)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, content)
    }
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest
fn resolve_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

// ============================================================================
// Safe Copy
// ============================================================================

/// Copy a file out of the originals (source read-only, dest guarded)
pub fn safe_copy(source: &Path, dest: &Path, guard: &WriteGuard) -> io::Result<u64> {
    guard.check(dest)?;
    let mut src_file = open_readonly(source)?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut dst_file = File::create(dest)?;

    io::copy(&mut src_file, &mut dst_file)
}

// ============================================================================
// Checksum Ledger
// ============================================================================

/// Blake3 digests of a manifest's files, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumLedger {
    digests: BTreeMap<PathBuf, String>,
}

impl ChecksumLedger {
    /// Record the current digest of every manifest entry
    pub fn record(manifest: &Manifest) -> io::Result<Self> {
        let mut digests = BTreeMap::new();
        for entry in manifest.entries() {
            digests.insert(entry.path.clone(), checksum_file(&manifest.absolute_path(entry))?);
        }
        Ok(Self { digests })
    }

    pub fn get(&self, relative: &Path) -> Option<&str> {
        self.digests.get(relative).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Relative paths whose current digest differs from the recorded one
    /// (unreadable files count as changed)
    pub fn changed(&self, manifest: &Manifest) -> Vec<PathBuf> {
        self.digests
            .iter()
            .filter(|(relative, recorded)| {
                match checksum_file(&manifest.root().join(relative)) {
                    Ok(current) => &current != *recorded,
                    Err(_) => true,
                }
            })
            .map(|(relative, _)| relative.clone())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_readonly_cannot_write() {
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.txt");
        fs::write(&path, "test content").unwrap();

        let mut file = open_readonly(&path).unwrap();
        assert!(file.write_all(b"x").is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "test content");
    }

    #[test]
    fn test_checksum_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.css");
        fs::write(&path, "body { color: #000; }").unwrap();

        let a = checksum_file(&path).unwrap();
        let b = checksum_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_guard_rejects_escapes() {
        let original = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let guard = WriteGuard::new(original.path(), workspace.path()).unwrap();

        assert!(guard.resolve(Path::new("css/app.css")).is_ok());
        assert!(guard.resolve(Path::new("../escape.css")).is_err());
        assert!(guard.resolve(original.path()).is_err());
        assert!(guard.check(&original.path().join("index.html")).is_err());
    }

    #[test]
    fn test_safe_copy() {
        let original = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let guard = WriteGuard::new(original.path(), workspace.path()).unwrap();

        let src = original.path().join("source.txt");
        fs::write(&src, "test content for copy").unwrap();
        let dst = guard.resolve(Path::new("nested/dest.txt")).unwrap();

        let bytes = safe_copy(&src, &dst, &guard).unwrap();
        assert_eq!(bytes, 21);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "test content for copy");

        // copying back over the original is refused
        assert!(safe_copy(&dst, &src, &guard).is_err());
        assert_eq!(fs::read_to_string(&src).unwrap(), "test content for copy");
    }

    #[test]
    fn test_ledger_detects_change() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.css"), "a{}").unwrap();
        fs::write(dir.path().join("b.html"), "<p></p>").unwrap();
        let manifest = Manifest::scan("u", dir.path()).unwrap();

        let ledger = ChecksumLedger::record(&manifest).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.changed(&manifest).is_empty());

        fs::write(dir.path().join("a.css"), "a{color:red}").unwrap();
        assert_eq!(ledger.changed(&manifest), vec![PathBuf::from("a.css")]);
    }
}

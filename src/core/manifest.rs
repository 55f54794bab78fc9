//! Manifest - read-only listing of the artifacts of one upload
//!
//! Entries are relative to the artifact root and kept sorted by path so
//! every consumer iterates in the same order.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};
use crate::readonly;

/// Artifact categories the detectors care about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Markup,
    Stylesheet,
    Script,
    Other,
}

impl ArtifactKind {
    /// Determine the artifact kind from a file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "html" | "htm" | "xhtml" | "qml" | "svg" => ArtifactKind::Markup,
            "css" | "scss" | "sass" | "less" => ArtifactKind::Stylesheet,
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => ArtifactKind::Script,
            _ => ArtifactKind::Other,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .map(|e| Self::from_extension(&e.to_string_lossy()))
            .unwrap_or(ArtifactKind::Other)
    }
}

/// A single artifact in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the artifact root
    pub path: PathBuf,
    pub size: u64,
    pub kind: ArtifactKind,
}

impl ManifestEntry {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        let kind = ArtifactKind::from_path(&path);
        Self { path, size, kind }
    }

    /// Forward-slash form of the relative path, used in evidence
    pub fn display_path(&self) -> String {
        self.path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Immutable artifact manifest for one upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    upload_id: String,
    root: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(upload_id: impl Into<String>, root: impl Into<PathBuf>, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        Self {
            upload_id: upload_id.into(),
            root: root.into(),
            entries,
        }
    }

    /// Build a manifest by walking a directory (hidden entries skipped)
    pub fn scan(upload_id: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root).map_err(|e| Error::io(&root, e))?;
        if !meta.is_dir() {
            return Err(Error::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact root is not a directory"),
            ));
        }

        let scan_root = root.clone();
        let mut entries = Vec::new();
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| e.path() == scan_root || !is_hidden(e))
        {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                Error::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            // walkdir only yields paths below root
            if let Ok(relative) = entry.path().strip_prefix(&root) {
                entries.push(ManifestEntry::new(relative, size));
            }
        }

        tracing::debug!("Scanned {} artifacts under {}", entries.len(), root.display());
        Ok(Self::new(upload_id, root, entries))
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn has_kind(&self, kind: ArtifactKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn entries_of(&self, kind: ArtifactKind) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn find(&self, relative: &Path) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == relative)
    }

    pub fn absolute_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.root.join(&entry.path)
    }

    /// Read an artifact's content through the read-only gate
    pub fn read_to_string(&self, entry: &ManifestEntry) -> Result<String> {
        let path = self.absolute_path(entry);
        let mut file = readonly::open_readonly(&path).map_err(|e| Error::io(&path, e))?;
        let mut bytes = Vec::with_capacity(entry.size as usize);
        file.read_to_end(&mut bytes).map_err(|e| Error::io(&path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Same upload and entries, content served from another root
    pub fn rebased(&self, root: impl Into<PathBuf>) -> Self {
        Self {
            upload_id: self.upload_id.clone(),
            root: root.into(),
            entries: self.entries.clone(),
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(ArtifactKind::from_extension("HTML"), ArtifactKind::Markup);
        assert_eq!(ArtifactKind::from_extension("css"), ArtifactKind::Stylesheet);
        assert_eq!(ArtifactKind::from_extension("tsx"), ArtifactKind::Script);
        assert_eq!(ArtifactKind::from_extension("png"), ArtifactKind::Other);
    }

    #[test]
    fn test_scan_sorts_and_skips_hidden() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("css/app.css"), "a{}").unwrap();
        std::fs::write(dir.path().join(".git/config"), "x").unwrap();

        let manifest = Manifest::scan("upload_1", dir.path()).unwrap();
        let paths: Vec<String> = manifest.entries().iter().map(|e| e.display_path()).collect();
        assert_eq!(paths, vec!["css/app.css", "index.html"]);
        assert!(manifest.has_kind(ArtifactKind::Stylesheet));
        assert!(!manifest.has_kind(ArtifactKind::Script));
        assert_eq!(manifest.total_bytes(), 13 + 3);
    }

    #[test]
    fn test_scan_rejects_missing_root() {
        let dir = tempdir().unwrap();
        let err = Manifest::scan("u", dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_read_and_rebase() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        std::fs::write(a.path().join("x.css"), "original").unwrap();
        std::fs::write(b.path().join("x.css"), "copy").unwrap();

        let manifest = Manifest::scan("u", a.path()).unwrap();
        let entry = &manifest.entries()[0];
        assert_eq!(manifest.read_to_string(entry).unwrap(), "original");

        let rebased = manifest.rebased(b.path());
        assert_eq!(rebased.read_to_string(&rebased.entries()[0]).unwrap(), "copy");
        assert_eq!(rebased.upload_id(), "u");
    }
}

//! Content fingerprinting for files and directories.
//!
//! A fingerprint is the digest of a canonical manifest listing every file's
//! relative path, content digest and size, sorted by path. Timestamps and
//! permissions are ignored, so byte-identical data always yields the same
//! fingerprint.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use tracing::debug;

use crate::cas::{CasStore, Digest};
use crate::domain::{ArtifactKind, StoreError, StoreResult};

/// One file in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the artifact root, `/`-separated.
    pub path: String,
    pub digest: Digest,
    pub size: u64,
}

/// Canonical description of an artifact's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub kind: ArtifactKind,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Canonical bytes: compact JSON with entries sorted by path.
    pub fn to_canonical_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut sorted = self.clone();
        sorted.entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(serde_json::to_vec(&sorted)?)
    }

    pub fn digest(&self) -> StoreResult<Digest> {
        Ok(Digest::compute(&self.to_canonical_bytes()?))
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn file_count(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Build the manifest for `path`. When `cache` is given, every file blob is
/// stored in it along the way.
pub fn build_manifest(path: &Path, cache: Option<&dyn CasStore>) -> StoreResult<Manifest> {
    if path.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = file_entry(path, name, cache)?;
        return Ok(Manifest {
            kind: ArtifactKind::File,
            entries: vec![entry],
        });
    }

    if !path.is_dir() {
        return Err(StoreError::MissingArtifact(path.to_path_buf()));
    }

    let mut files = Vec::new();
    collect_files(path, &mut files)?;
    files.sort();

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let relative = file.strip_prefix(path).unwrap_or(&file);
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(file_entry(&file, rel, cache)?);
    }

    Ok(Manifest {
        kind: ArtifactKind::Directory,
        entries,
    })
}

/// Fingerprint `path` without storing anything.
pub fn fingerprint(path: &Path) -> StoreResult<Digest> {
    let manifest = build_manifest(path, None)?;
    let digest = manifest.digest()?;
    debug!(path = %path.display(), digest = %digest.short(), "fingerprint");
    Ok(digest)
}

fn file_entry(path: &Path, rel: String, cache: Option<&dyn CasStore>) -> StoreResult<ManifestEntry> {
    let size = std::fs::metadata(path)?.len();
    let digest = match cache {
        Some(cache) => cache.put_file(path)?,
        None => hash_file(path)?,
    };
    Ok(ManifestEntry {
        path: rel,
        digest,
        size,
    })
}

fn hash_file(path: &Path) -> StoreResult<Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(Digest::from_hasher(hasher))
}

// Hidden entries (`.gitignore`, `.DS_Store`, editor swap files) are not data.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> StoreResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }

        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

//! Artifact store: content versioning for data and model files.
//!
//! Each versioned artifact has a small pointer file (`<path>.ptr`) committed
//! alongside the code. The pointer names the digest of the artifact's
//! manifest; the manifest and file blobs live in a local content-addressed
//! cache and are pushed to a remote store on demand.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cas::fs::FsCasStore;
use crate::cas::{CasStore, Digest};
use crate::domain::{
    pointer_path_for, ArtifactDescriptor, StoreError, StoreResult, VersionPointer,
};
use crate::fingerprint::{build_manifest, Manifest};

/// Content-versioned artifact storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fingerprint the artifact and record it as the current version.
    ///
    /// Idempotent: recording unchanged content leaves the pointer untouched
    /// and returns a pointer whose `previous` equals its `digest`.
    async fn record_version(&self, artifact: &ArtifactDescriptor) -> StoreResult<VersionPointer>;

    /// Whether `pointer` differs from the version recorded before it.
    async fn diff_against_previous(&self, pointer: &VersionPointer) -> StoreResult<bool>;

    /// Upload the versioned content to the remote backend.
    async fn push(&self, pointer: &VersionPointer) -> StoreResult<()>;

    /// Remove the version pointer of a retired artifact path, if present.
    /// Returns the removed pointer path.
    async fn retire(&self, stale: &Path) -> StoreResult<Option<PathBuf>>;
}

/// Filesystem artifact store rooted at a working copy.
pub struct FsArtifactStore {
    workdir: PathBuf,
    cache: FsCasStore,
    remote: Option<FsCasStore>,
}

impl FsArtifactStore {
    /// `cache_dir` and `remote_dir` may be relative to `workdir`.
    pub fn open(
        workdir: impl Into<PathBuf>,
        cache_dir: &Path,
        remote_dir: Option<&Path>,
    ) -> StoreResult<Self> {
        let workdir = workdir.into();
        let cache = FsCasStore::new(workdir.join(cache_dir))?;
        let remote = remote_dir
            .map(|dir| FsCasStore::new(workdir.join(dir)))
            .transpose()?;
        Ok(Self {
            workdir,
            cache,
            remote,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Read the pointer currently recorded for `artifact`, if any.
    pub fn current_pointer(&self, artifact: &ArtifactDescriptor) -> StoreResult<Option<VersionPointer>> {
        read_pointer(&self.workdir.join(artifact.pointer_path()))
    }

    fn load_manifest(&self, digest: &Digest) -> StoreResult<Manifest> {
        let bytes = self.cache.get(digest)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn record_version(&self, artifact: &ArtifactDescriptor) -> StoreResult<VersionPointer> {
        let source = self.workdir.join(&artifact.path);
        let manifest = build_manifest(&source, Some(&self.cache))?;
        let digest = self.cache.put(&manifest.to_canonical_bytes()?)?;

        let pointer_file = self.workdir.join(artifact.pointer_path());
        let previous = read_pointer(&pointer_file)?.map(|p| p.digest);

        let pointer = VersionPointer {
            name: artifact.name.clone(),
            path: artifact.path.clone(),
            digest,
            kind: manifest.kind,
            files: manifest.file_count(),
            bytes: manifest.total_bytes(),
            previous,
        };

        if pointer.is_new_version() {
            write_pointer(&pointer_file, &pointer)?;
            info!(
                artifact = %artifact.name,
                digest = %digest.short(),
                files = pointer.files,
                bytes = pointer.bytes,
                "Recorded new artifact version"
            );
        } else {
            debug!(artifact = %artifact.name, digest = %digest.short(), "Artifact version unchanged");
        }

        Ok(pointer)
    }

    async fn diff_against_previous(&self, pointer: &VersionPointer) -> StoreResult<bool> {
        Ok(pointer.is_new_version())
    }

    async fn push(&self, pointer: &VersionPointer) -> StoreResult<()> {
        let Some(remote) = &self.remote else {
            info!(artifact = %pointer.name, "No artifact remote configured, skipping push");
            return Ok(());
        };

        let push_err = |reason: String| StoreError::Push {
            name: pointer.name.clone(),
            digest: pointer.digest.short(),
            reason,
        };

        let manifest = self
            .load_manifest(&pointer.digest)
            .map_err(|e| push_err(format!("manifest unavailable: {e}")))?;

        let mut uploaded = 0usize;
        for entry in &manifest.entries {
            if self
                .cache
                .copy_into(remote, &entry.digest)
                .map_err(|e| push_err(format!("{}: {e}", entry.path)))?
            {
                uploaded += 1;
            }
        }
        // Manifest last, so a present manifest implies all blobs are present.
        self.cache
            .copy_into(remote, &pointer.digest)
            .map_err(|e| push_err(format!("manifest: {e}")))?;

        info!(
            artifact = %pointer.name,
            digest = %pointer.digest.short(),
            uploaded = uploaded,
            total = manifest.entries.len(),
            remote = %remote.root().display(),
            "Pushed artifact"
        );
        Ok(())
    }

    async fn retire(&self, stale: &Path) -> StoreResult<Option<PathBuf>> {
        let relative = pointer_path_for(stale);
        let absolute = self.workdir.join(&relative);
        if !absolute.exists() {
            return Ok(None);
        }
        std::fs::remove_file(&absolute)?;
        info!(pointer = %relative.display(), "Retired stale version pointer");
        Ok(Some(relative))
    }
}

/// Parse a pointer file; `None` if it does not exist.
pub fn read_pointer(path: &Path) -> StoreResult<Option<VersionPointer>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Pointer {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn write_pointer(path: &Path, pointer: &VersionPointer) -> StoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut json = serde_json::to_string_pretty(pointer)?;
    json.push('\n');

    let tmp = NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), json)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

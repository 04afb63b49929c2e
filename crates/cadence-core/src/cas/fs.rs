use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest as Sha2Digest, Sha256};
use tempfile::NamedTempFile;

use super::{CasError, CasStore, Digest, Result};

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
///
/// Used both as the local artifact cache and as a directory-based remote.
#[derive(Debug)]
pub struct FsCasStore {
    root: PathBuf,
    objects_dir: PathBuf,
}

impl FsCasStore {
    /// Create a new `FsCasStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let objects_dir = root.join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { root, objects_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn shard_dir(&self, digest: &Digest) -> Result<PathBuf> {
        let dir = self.objects_dir.join(&digest.to_hex()[..2]);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Copy the blob for `digest` into `other`. Returns `false` if `other`
    /// already held it.
    pub fn copy_into(&self, other: &FsCasStore, digest: &Digest) -> Result<bool> {
        let target = other.blob_path(digest);
        if target.exists() {
            return Ok(false);
        }
        let source = self.blob_path(digest);
        if !source.exists() {
            return Err(CasError::NotFound(*digest));
        }

        let mut tmp = NamedTempFile::new_in(other.shard_dir(digest)?)?;
        io::copy(&mut File::open(&source)?, &mut tmp)?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(true)
    }
}

impl CasStore for FsCasStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        // Atomic write: temp file in the shard directory, then rename.
        let mut tmp = NamedTempFile::new_in(self.shard_dir(&digest)?)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(digest)
    }

    fn put_file(&self, path: &Path) -> Result<Digest> {
        // Hash while copying into a temp file in the objects dir; the shard is
        // only known once the digest is.
        let mut reader = BufReader::new(File::open(path)?);
        let mut tmp = NamedTempFile::new_in(&self.objects_dir)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }

        let digest = Digest::from_hasher(hasher);
        let target = self.blob_path(&digest);
        if !target.exists() {
            self.shard_dir(&digest)?;
            tmp.persist(&target).map_err(|e| e.error)?;
        }
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CasError::NotFound(*digest)
            } else {
                CasError::Io(e)
            }
        })
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn blob_roundtrip() {
        let (_dir, store) = make_store();
        let data = b"1,31,2.5,1260759144\n";
        let digest = store.put(data).unwrap();
        assert_eq!(store.get(&digest).unwrap(), data);
    }

    #[test]
    fn dedupe_invariant() {
        let (dir, store) = make_store();
        let d1 = store.put(b"duplicate me").unwrap();
        let d2 = store.put(b"duplicate me").unwrap();
        assert_eq!(d1, d2);

        let hex = d1.to_hex();
        let shard = dir.path().join("objects").join(&hex[..2]);
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn put_file_matches_put_bytes() {
        let (dir, store) = make_store();
        let data = vec![0x5Au8; 200_000];
        let file = dir.path().join("ratings.csv");
        std::fs::write(&file, &data).unwrap();

        let from_file = store.put_file(&file).unwrap();
        assert_eq!(from_file, Digest::compute(&data));
        assert_eq!(store.get(&from_file).unwrap(), data);
        // Second put of identical content is a no-op.
        assert_eq!(store.put(&data).unwrap(), from_file);
    }

    #[test]
    fn get_nonexistent_returns_not_found() {
        let (_dir, store) = make_store();
        let fake = Digest::compute(b"no such blob");
        match store.get(&fake) {
            Err(CasError::NotFound(d)) => assert_eq!(d, fake),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(!store.exists(&fake).unwrap());
    }

    #[test]
    fn copy_into_transfers_once() {
        let (_a, local) = make_store();
        let (_b, remote) = make_store();
        let digest = local.put(b"movieId,title,genres").unwrap();

        assert!(local.copy_into(&remote, &digest).unwrap());
        assert!(remote.exists(&digest).unwrap());
        assert!(!local.copy_into(&remote, &digest).unwrap());
        assert_eq!(remote.get(&digest).unwrap(), b"movieId,title,genres");
    }

    #[test]
    fn copy_into_missing_source_fails() {
        let (_a, local) = make_store();
        let (_b, remote) = make_store();
        let fake = Digest::compute(b"never stored");
        assert!(matches!(
            local.copy_into(&remote, &fake),
            Err(CasError::NotFound(_))
        ));
    }
}

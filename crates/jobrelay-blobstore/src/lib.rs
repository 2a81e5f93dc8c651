//! The blob-store contract (§6): `put`/`get` for bytes, `put_file`/`get_file`
//! for whole files, content-addressed and idempotent. This is an external
//! collaborator per §1 ("out of scope... referred to as the *blob store*");
//! this crate defines the interface the rest of the workspace consumes and
//! ships one concrete, content-addressed filesystem implementation so the
//! crate is runnable and testable without a real deployment.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};
use jobrelay_util::fs::Fs;
use sha2::{Digest, Sha256};

pub const URI_SCHEME: &str = "blob://";

/// `put(bytes) -> uri` content-addressed; `get(uri) -> bytes`;
/// `put_file(path) -> uri`; `get_file(uri) -> path`. Idempotent on content.
pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<String>;
    fn get(&self, uri: &str) -> Result<Vec<u8>>;
    fn put_file(&self, path: &Path) -> Result<String>;
    fn get_file(&self, uri: &str) -> Result<PathBuf>;
}

fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A content-addressed blob store rooted at a directory, the reference
/// implementation consumed by `jobrelay-codec`'s tests and by `jobrelay-cli`
/// when no external blob store is configured. Grounded in the teacher's own
/// `DigestRespository` (content hashing keyed by sha256,
/// `maelstrom-client/src/lib.rs`) and in `original_source/hither2`'s use of
/// `kachery`, a content-addressed store keyed the same way.
pub struct FsBlobStore {
    root: PathBuf,
    fs: Fs,
}

impl FsBlobStore {
    /// Opens (creating if necessary) a blob store rooted at `root`. Per §6
    /// ("if the blob storage directory env var is unset, abort before
    /// container start"), callers that source `root` from
    /// `BLOB_STORAGE_DIR` must check that the env var was actually set
    /// before calling this.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let fs = Fs::new();
        fs.create_dir_all(&root)?;
        Ok(Self { root, fs })
    }

    fn path_for_digest(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    fn digest_from_uri<'a>(&self, uri: &'a str) -> Result<&'a str> {
        uri.strip_prefix(URI_SCHEME)
            .ok_or_else(|| anyhow!("not a blob uri: {uri}"))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let digest = digest_of(bytes);
        let path = self.path_for_digest(&digest);
        if !self.fs.exists(&path) {
            self.fs
                .write(&path, bytes)
                .with_context(|| format!("writing blob {digest}"))?;
        }
        Ok(format!("{URI_SCHEME}{digest}"))
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let digest = self.digest_from_uri(uri)?;
        self.fs.read(self.path_for_digest(digest))
    }

    fn put_file(&self, path: &Path) -> Result<String> {
        let bytes = self.fs.read(path)?;
        self.put(&bytes)
    }

    fn get_file(&self, uri: &str) -> Result<PathBuf> {
        let digest = self.digest_from_uri(uri)?;
        let path = self.path_for_digest(digest);
        if !self.fs.exists(&path) {
            return Err(anyhow!("no such blob: {uri}"));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent_on_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let uri1 = store.put(b"hello").unwrap();
        let uri2 = store.put(b"hello").unwrap();
        assert_eq!(uri1, uri2);
        assert_eq!(store.get(&uri1).unwrap(), b"hello");
    }

    #[test]
    fn empty_bytes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let uri = store.put(b"").unwrap();
        assert_eq!(store.get(&uri).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn put_file_then_get_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("store")).unwrap();
        let src = dir.path().join("source.txt");
        std::fs::write(&src, b"file contents").unwrap();
        let uri = store.put_file(&src).unwrap();
        let fetched_path = store.get_file(&uri).unwrap();
        assert_eq!(std::fs::read(fetched_path).unwrap(), b"file contents");
    }
}

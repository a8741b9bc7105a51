//! Persistence adapter: blob storage across restarts.
//!
//! The store keeps at most one blob per document kind plus any number of
//! triggered payload files, all under one directory and one byte budget.
//! Writes that would exceed the budget fail with
//! [`PersistencyError::DiskFull`]; the caller decides what to evict.
//! Reads are best effort: a missing or unreadable blob means "nothing was
//! persisted" and the caller proceeds accordingly.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Timestamp;

/// Document kinds with a dedicated blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    DecoderManifest,
    CampaignList,
    StateTemplates,
}

impl BlobKind {
    const fn file_name(self) -> &'static str {
        match self {
            Self::DecoderManifest => "decoder_manifest.bin",
            Self::CampaignList => "collection_schemes.bin",
            Self::StateTemplates => "state_templates.bin",
        }
    }
}

/// Errors surfaced by the blob store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistencyError {
    /// The write would exceed the configured byte budget.
    #[error("persistency budget exhausted: need {needed} of {budget} bytes")]
    DiskFull { needed: u64, budget: u64 },

    /// Nothing is persisted under this kind.
    #[error("no persisted data")]
    Empty,

    #[error("persistency I/O error: {0}")]
    Io(#[from] io::Error),
}

/// File-backed blob store with a single byte budget.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
    max_bytes: u64,
    payload_seq: AtomicU64,
}

impl BlobStore {
    /// Open (creating if needed) the store at `dir`.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, PersistencyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_bytes,
            payload_seq: AtomicU64::new(0),
        })
    }

    /// Persist `bytes` as the one blob of `kind` (last writer wins).
    ///
    /// # Errors
    ///
    /// [`PersistencyError::DiskFull`] when the budget would be exceeded;
    /// I/O errors otherwise.
    pub fn write(&self, kind: BlobKind, bytes: &[u8]) -> Result<(), PersistencyError> {
        let path = self.dir.join(kind.file_name());
        let replaced = file_size(&path);
        self.check_budget(bytes.len() as u64, replaced)?;
        write_atomically(&path, bytes)?;
        debug!(kind = ?kind, size = bytes.len(), "persisted document");
        Ok(())
    }

    /// Read the blob of `kind`.
    ///
    /// # Errors
    ///
    /// [`PersistencyError::Empty`] when nothing (or an empty file) is
    /// persisted; I/O errors otherwise.
    pub fn read(&self, kind: BlobKind) -> Result<Vec<u8>, PersistencyError> {
        let path = self.dir.join(kind.file_name());
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Err(PersistencyError::Empty),
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => Err(PersistencyError::Empty),
            Err(error) => Err(error.into()),
        }
    }

    /// Delete the blob of `kind`. Deleting a missing blob is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors other than not-found.
    pub fn erase(&self, kind: BlobKind) -> Result<(), PersistencyError> {
        let path = self.dir.join(kind.file_name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Persist one triggered payload under a fresh `payload-<ts>-<seq>.bin`
    /// name.
    ///
    /// # Errors
    ///
    /// [`PersistencyError::DiskFull`] when the budget would be exceeded.
    pub fn write_payload(
        &self,
        bytes: &[u8],
        timestamp_ms: Timestamp,
    ) -> Result<PathBuf, PersistencyError> {
        self.check_budget(bytes.len() as u64, 0)?;
        let seq = self.payload_seq.fetch_add(1, Ordering::Relaxed);
        // Zero-padded so lexicographic directory order is arrival order.
        let path = self
            .dir
            .join(format!("payload-{timestamp_ms:015}-{seq:06}.bin"));
        write_atomically(&path, bytes)?;
        debug!(path = %path.display(), size = bytes.len(), "persisted payload");
        Ok(path)
    }

    /// Remove and return all persisted payloads, oldest first.
    ///
    /// Unreadable files are skipped (and removed) rather than failing the
    /// drain.
    #[must_use]
    pub fn drain_payloads(&self) -> Vec<Vec<u8>> {
        let mut paths: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("payload-") && n.ends_with(".bin"))
                })
                .collect(),
            Err(error) => {
                warn!(%error, "failed to list persisted payloads");
                return Vec::new();
            }
        };
        paths.sort();
        let mut payloads = Vec::with_capacity(paths.len());
        for path in paths {
            match fs::read(&path) {
                Ok(bytes) => payloads.push(bytes),
                Err(error) => warn!(path = %path.display(), %error, "skipping unreadable payload"),
            }
            if let Err(error) = fs::remove_file(&path) {
                warn!(path = %path.display(), %error, "failed to remove persisted payload");
            }
        }
        payloads
    }

    /// Bytes currently used by everything in the store.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }

    fn check_budget(&self, incoming: u64, replaced: u64) -> Result<(), PersistencyError> {
        let needed = self.total_size().saturating_sub(replaced) + incoming;
        if needed > self.max_bytes {
            return Err(PersistencyError::DiskFull {
                needed,
                budget: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Write via a temporary sibling and rename, so a crash never leaves a
/// half-written blob behind.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_bytes: u64) -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path(), max_bytes).expect("store");
        (dir, store)
    }

    #[test]
    fn write_then_read_returns_the_blob() {
        let (_dir, store) = store(1024);
        store.write(BlobKind::DecoderManifest, b"manifest").unwrap();
        assert_eq!(store.read(BlobKind::DecoderManifest).unwrap(), b"manifest");
    }

    #[test]
    fn last_writer_wins_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BlobStore::new(dir.path(), 1024).unwrap();
            store.write(BlobKind::CampaignList, b"first").unwrap();
            store.write(BlobKind::CampaignList, b"second").unwrap();
        }
        // A new instance over the same directory sees the last write.
        let store = BlobStore::new(dir.path(), 1024).unwrap();
        assert_eq!(store.read(BlobKind::CampaignList).unwrap(), b"second");
    }

    #[test]
    fn missing_blob_reads_empty() {
        let (_dir, store) = store(1024);
        assert!(matches!(
            store.read(BlobKind::StateTemplates),
            Err(PersistencyError::Empty)
        ));
    }

    #[test]
    fn erase_removes_the_blob_and_tolerates_absence() {
        let (_dir, store) = store(1024);
        store.write(BlobKind::DecoderManifest, b"x").unwrap();
        store.erase(BlobKind::DecoderManifest).unwrap();
        assert!(matches!(
            store.read(BlobKind::DecoderManifest),
            Err(PersistencyError::Empty)
        ));
        store.erase(BlobKind::DecoderManifest).unwrap();
    }

    #[test]
    fn budget_rejects_oversized_writes() {
        let (_dir, store) = store(16);
        let err = store
            .write(BlobKind::DecoderManifest, &[0u8; 32])
            .unwrap_err();
        assert!(matches!(err, PersistencyError::DiskFull { .. }));
    }

    #[test]
    fn replacing_a_blob_does_not_double_count() {
        let (_dir, store) = store(16);
        store.write(BlobKind::DecoderManifest, &[0u8; 12]).unwrap();
        // 12 + 12 would exceed 16, but the old blob is replaced.
        store.write(BlobKind::DecoderManifest, &[1u8; 12]).unwrap();
    }

    #[test]
    fn payloads_drain_oldest_first() {
        let (_dir, store) = store(1024);
        store.write_payload(b"one", 100).unwrap();
        store.write_payload(b"two", 200).unwrap();
        let drained = store.drain_payloads();
        assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(store.drain_payloads().is_empty());
    }

    #[test]
    fn payload_budget_is_shared_with_blobs() {
        let (_dir, store) = store(20);
        store.write(BlobKind::DecoderManifest, &[0u8; 16]).unwrap();
        assert!(matches!(
            store.write_payload(&[0u8; 8], 100),
            Err(PersistencyError::DiskFull { .. })
        ));
    }
}

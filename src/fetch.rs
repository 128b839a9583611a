//! Stand-in origin transport (`pk_engine::ChunkFetcher`). The wire protocol
//! itself is out of scope ("Out of scope: actual network transport (HTTP
//! range-GET). Modeled as a `ChunkFetcher` trait.") so this treats a local
//! directory laid out the same way as a parcel's chunk area (spec §6.2,
//! `{prefix}/{dir:04}/{idx:04}`) as the origin. A parcel's `RPATH` key
//! names that directory.

use std::fs;
use std::path::{Path, PathBuf};

use pk_engine::ChunkFetcher;
use pk_types::error::{ErrorKind, PkError};

pub struct LocalDirFetcher {
    root: PathBuf,
    chunk_size: u32,
    chunks_per_dir: u32,
}

impl LocalDirFetcher {
    pub fn new(root: impl Into<PathBuf>, chunk_size: u32, chunks_per_dir: u32) -> Self {
        Self {
            root: root.into(),
            chunk_size,
            chunks_per_dir,
        }
    }

    fn blob_path(&self, index: u64) -> PathBuf {
        let dir = index / self.chunks_per_dir as u64;
        let idx = index % self.chunks_per_dir as u64;
        self.root.join(format!("{dir:04}")).join(format!("{idx:04}"))
    }
}

impl ChunkFetcher for LocalDirFetcher {
    fn fetch_range(&self, start: u64, _len: usize) -> Result<Vec<u8>, PkError> {
        let index = start / self.chunk_size as u64;
        let path = self.blob_path(index);
        fs::read(&path)
            .map_err(|e| PkError::with_source(ErrorKind::NetFail, format!("origin fetch for {}", path.display()), e.into()))
    }
}

/// Writes an already-encoded blob at its canonical origin path, creating
/// parent directories as needed. Used by `upload` to publish chunks to
/// the directory a later `LocalDirFetcher` will serve from.
pub fn put_blob(root: &Path, index: u64, chunks_per_dir: u32, blob: &[u8]) -> Result<(), PkError> {
    let dir = index / chunks_per_dir as u64;
    let idx = index % chunks_per_dir as u64;
    let dir_path = root.join(format!("{dir:04}"));
    fs::create_dir_all(&dir_path)?;
    fs::write(dir_path.join(format!("{idx:04}")), blob)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fetches_blob_at_computed_path() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("0000")).unwrap();
        fs::write(dir.path().join("0000").join("0003"), b"blob").unwrap();
        let fetcher = LocalDirFetcher::new(dir.path(), 128, 512);
        let data = fetcher.fetch_range(3 * 128, 128).unwrap();
        assert_eq!(data, b"blob");
    }

    #[test]
    fn missing_blob_is_netfail() {
        let dir = tempdir().unwrap();
        let fetcher = LocalDirFetcher::new(dir.path(), 128, 512);
        let err = fetcher.fetch_range(0, 128).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetFail);
    }

    #[test]
    fn put_then_fetch_round_trips() {
        let dir = tempdir().unwrap();
        put_blob(dir.path(), 4100, 4096, b"hello").unwrap();
        let fetcher = LocalDirFetcher::new(dir.path(), 128, 4096);
        assert_eq!(fetcher.fetch_range(4100 * 128, 128).unwrap(), b"hello");
    }
}

//! Modified store (spec §4.5 glossary "Modified store"): the engine's
//! per-run overlay, consulted by `get_chunk` ahead of Local/Hoard/Origin
//! for any chunk whose plaintext this session has set aside directly
//! rather than routing through a `put_chunk` re-encode. Today the only
//! writer is `BlockFile::truncate`'s snapshot-before-free step, via
//! `ChunkEngine::mark_modified`.
//!
//! Unlike LocalCache this carries no header: it is a per-run temp file,
//! not part of the parcel's durable state, so the layout only needs to
//! make sense for the lifetime of one mount.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use pk_types::error::PkError;
use pk_types::ChunkIndex;

pub struct ModifiedStore {
    file: File,
    chunk_size: u32,
    bits: Mutex<HashSet<ChunkIndex>>,
}

impl ModifiedStore {
    pub fn create(path: impl AsRef<Path>, chunk_size: u32) -> Result<Self, PkError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            file,
            chunk_size,
            bits: Mutex::new(HashSet::new()),
        })
    }

    pub fn is_modified(&self, i: ChunkIndex) -> bool {
        self.bits.lock().unwrap().contains(&i)
    }

    /// Records `data` (zero-padded to a full chunk) as chunk `i`'s pending
    /// snapshot and marks it modified.
    pub fn snapshot(&self, i: ChunkIndex, data: &[u8]) -> Result<(), PkError> {
        let mut padded = vec![0u8; self.chunk_size as usize];
        let n = data.len().min(padded.len());
        padded[..n].copy_from_slice(&data[..n]);
        self.file.write_all_at(&padded, i * self.chunk_size as u64)?;
        self.bits.lock().unwrap().insert(i);
        Ok(())
    }

    pub fn read(&self, i: ChunkIndex, buf: &mut [u8]) -> Result<(), PkError> {
        self.file.read_exact_at(buf, i * self.chunk_size as u64)?;
        Ok(())
    }

    /// Drops chunk `i`'s pending snapshot once it no longer needs special
    /// handling (freed by truncate, or committed upstream).
    pub fn clear(&self, i: ChunkIndex) {
        self.bits.lock().unwrap().remove(&i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = ModifiedStore::create(dir.path().join("modified.img"), 16).unwrap();
        assert!(!store.is_modified(3));
        store.snapshot(3, b"hello").unwrap();
        assert!(store.is_modified(3));
        let mut buf = vec![0u8; 16];
        store.read(3, &mut buf).unwrap();
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(&buf[5..], &[0u8; 11]);
    }

    #[test]
    fn clear_removes_from_modified_set() {
        let dir = tempdir().unwrap();
        let store = ModifiedStore::create(dir.path().join("modified.img"), 16).unwrap();
        store.snapshot(1, b"x").unwrap();
        store.clear(1);
        assert!(!store.is_modified(1));
    }
}

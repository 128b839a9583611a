//! Byte-range block device surface over a [`ChunkEngine`] (spec §4.7):
//! translates `(offset, length)` reads/writes into per-chunk operations
//! against the [`WritebackCache`], and implements truncate's grow/shrink
//! semantics including the Modified-store safety snapshot. The Modified
//! store itself lives in `pk-engine` — `ChunkEngine` is the thing that
//! actually consults it on read (spec §4.5's Modified → Local → Hoard →
//! Origin fallthrough) — so this crate only reaches it through
//! [`EngineBackend`]'s pass-through methods.

use std::sync::{Arc, Mutex, RwLock};

pub use pk_engine::ModifiedStore;
use pk_engine::ChunkEngine;
use pk_types::error::{ErrorKind, PkError};
use pk_types::{ChunkIndex, Compression};
use pk_writeback::{ChunkBackend, WritebackCache};

/// Adapts a [`ChunkEngine`] to the `WritebackCache`'s fault-in/flush shape.
/// A miss that resolves to `NOT_FOUND` (no keyring row — an unwritten tail
/// chunk after growth, or one `forget_chunk` freed on shrink) reads back
/// as zero-fill rather than an error, per spec §4.7's "new tail chunks are
/// absent... present only via zero-fill on read".
pub struct EngineBackend {
    engine: Mutex<ChunkEngine>,
    allowed: Vec<Compression>,
}

impl EngineBackend {
    pub fn new(engine: ChunkEngine, allowed: Vec<Compression>) -> Self {
        Self {
            engine: Mutex::new(engine),
            allowed,
        }
    }

    /// Removes chunk `i`'s keyring row directly; used by truncate once its
    /// plaintext (if any) has already been preserved in the Modified store.
    pub fn forget(&self, i: ChunkIndex) -> Result<(), PkError> {
        self.engine.lock().unwrap().forget_chunk(i)
    }

    pub fn count_valid(&self) -> Result<u64, PkError> {
        self.engine.lock().unwrap().count_valid()
    }

    pub fn is_modified(&self, i: ChunkIndex) -> bool {
        self.engine.lock().unwrap().is_modified(i)
    }

    pub fn mark_modified(&self, i: ChunkIndex, data: &[u8]) -> Result<(), PkError> {
        self.engine.lock().unwrap().mark_modified(i, data)
    }

    pub fn clear_modified(&self, i: ChunkIndex) {
        self.engine.lock().unwrap().clear_modified(i)
    }
}

impl ChunkBackend for EngineBackend {
    fn fault_in(&self, index: ChunkIndex, buf: &mut [u8]) -> Result<usize, PkError> {
        match self.engine.lock().unwrap().get_chunk(index, buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                buf.fill(0);
                Ok(buf.len())
            }
            Err(err) => Err(err),
        }
    }

    fn flush(&self, index: ChunkIndex, data: &[u8]) -> Result<(), PkError> {
        self.engine.lock().unwrap().put_chunk(index, data, &self.allowed)
    }
}

/// Translates arbitrary byte-range I/O onto whole-chunk operations, and
/// owns the logical size `S` separately from the parcel's chunk count
/// upper bound (grow/shrink only change `S`, not `N`).
pub struct BlockFile {
    backend: Arc<EngineBackend>,
    writeback: Arc<WritebackCache>,
    chunk_size: u64,
    size: RwLock<u64>,
}

impl BlockFile {
    pub fn new(backend: Arc<EngineBackend>, writeback: Arc<WritebackCache>, chunk_size: u32, initial_size: u64) -> Self {
        Self {
            backend,
            writeback,
            chunk_size: chunk_size as u64,
            size: RwLock::new(initial_size),
        }
    }

    pub fn size(&self) -> u64 {
        *self.size.read().unwrap()
    }

    /// Number of chunks resident in LocalCache, for `statfs`
    /// (spec §6.7: `bfree = N - count_valid`).
    pub fn count_valid(&self) -> Result<u64, PkError> {
        self.backend.count_valid()
    }

    /// Reads into `buf`, clamped to EOF; returns the number of bytes
    /// actually read (short or zero past EOF, per spec §4.7).
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PkError> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;
        let mut done = 0usize;
        let mut chunk_buf = vec![0u8; self.chunk_size as usize];
        while done < want {
            let pos = offset + done as u64;
            let i = pos / self.chunk_size;
            let inner_off = (pos - i * self.chunk_size) as usize;
            let inner_len = (self.chunk_size as usize - inner_off).min(want - done);
            self.writeback.read(i, &mut chunk_buf)?;
            buf[done..done + inner_len].copy_from_slice(&chunk_buf[inner_off..inner_off + inner_len]);
            done += inner_len;
        }
        Ok(done)
    }

    /// Writes `data`, extending the logical size if the range reaches
    /// past current EOF (spec §4.7: "writes past current S extend the
    /// image").
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), PkError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| PkError::new(ErrorKind::InvalidArgument, "write range overflows u64"))?;

        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let i = pos / self.chunk_size;
            let inner_off = (pos - i * self.chunk_size) as usize;
            let inner_len = (self.chunk_size as usize - inner_off).min(data.len() - done);
            let slice = &data[done..done + inner_len];
            self.writeback.write_with(i, |chunk| {
                chunk[inner_off..inner_off + inner_len].copy_from_slice(slice);
            })?;
            done += inner_len;
        }

        let mut size = self.size.write().unwrap();
        if end > *size {
            *size = end;
        }
        Ok(())
    }

    /// `S' > S`: records the new size; tail chunks stay absent until
    /// first write or read (zero-fill via [`EngineBackend::fault_in`]).
    /// `S' < S`: snapshots the new last partial chunk into the Modified
    /// store (if not already there), then frees every chunk at or past
    /// the new chunk count in ascending index order.
    pub fn truncate(&self, new_size: u64) -> Result<(), PkError> {
        let old_size = {
            let mut size = self.size.write().unwrap();
            let old = *size;
            if new_size >= old {
                *size = new_size;
                return Ok(());
            }
            *size = new_size;
            old
        };

        let new_last_chunk = if new_size == 0 { None } else { Some((new_size - 1) / self.chunk_size) };

        // Zero the new last chunk's tail in place and mark it dirty, so the
        // correct (truncated) content is what eventually gets flushed back
        // to the engine — not a stale full chunk a later regrow could
        // resurrect. The Modified-store snapshot is what actually serves a
        // concurrent read of this chunk ahead of the stale (pre-truncate)
        // keyring/Local content until the writeback flush lands.
        if let Some(last) = new_last_chunk {
            let tail_len = (new_size - last * self.chunk_size) as usize;
            if tail_len < self.chunk_size as usize && !self.backend.is_modified(last) {
                self.writeback.write_with(last, |chunk| chunk[tail_len..].fill(0))?;
                let mut buf = vec![0u8; self.chunk_size as usize];
                self.writeback.read(last, &mut buf)?;
                self.backend.mark_modified(last, &buf)?;
            }
        }

        let first_freed = new_last_chunk.map(|l| l + 1).unwrap_or(0);
        if old_size > 0 {
            let old_last_chunk = (old_size - 1) / self.chunk_size;
            for i in first_freed..=old_last_chunk {
                self.writeback.evict(i);
                self.backend.forget(i)?;
                self.backend.clear_modified(i);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pk_engine::{ChunkEngine, ChunkFetcher, NoopEvents};
    use pk_hoard_cache::HoardCache;
    use pk_keyring::{Interrupt, Keyring};
    use pk_local_cache::LocalCache;
    use pk_types::CryptoSuite;
    use tempfile::tempdir;

    struct FailFetcher;
    impl ChunkFetcher for FailFetcher {
        fn fetch_range(&self, _start: u64, _len: usize) -> Result<Vec<u8>, PkError> {
            Err(PkError::new(ErrorKind::NetFail, "no origin in test"))
        }
    }

    fn make_blockfile(dir: &std::path::Path, n: u32, chunk_size: u32, logical_size: u64) -> BlockFile {
        let keyring = Keyring::create(dir.join("keyring.db"), Interrupt::new()).unwrap();
        let local = LocalCache::create(dir.join("local.img"), n, chunk_size).unwrap();
        let hoard = HoardCache::create(dir.join("hoard"), chunk_size, CryptoSuite::AesSha1).unwrap();
        let modified = ModifiedStore::create(dir.join("modified.img"), chunk_size).unwrap();
        let engine = ChunkEngine::new(
            keyring,
            local,
            hoard,
            modified,
            Box::new(FailFetcher),
            Box::new(NoopEvents),
            chunk_size,
            logical_size,
            CryptoSuite::AesSha1,
        );
        let backend = Arc::new(EngineBackend::new(engine, vec![Compression::Zlib, Compression::None]));
        let writeback = WritebackCache::spawn(chunk_size, n as u64, backend.clone());
        BlockFile::new(backend, writeback, chunk_size, logical_size)
    }

    #[test]
    fn write_then_read_round_trips_within_one_chunk() {
        let dir = tempdir().unwrap();
        let bf = make_blockfile(dir.path(), 4, 64, 256);
        bf.write_at(10, b"hello").unwrap();
        let mut out = vec![0u8; 5];
        let n = bf.read_at(10, &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn write_spanning_chunk_boundary_round_trips() {
        let dir = tempdir().unwrap();
        let bf = make_blockfile(dir.path(), 4, 64, 256);
        let data: Vec<u8> = (0..100u16).map(|x| (x % 256) as u8).collect();
        bf.write_at(30, &data).unwrap();
        let mut out = vec![0u8; 100];
        let n = bf.read_at(30, &mut out).unwrap();
        assert_eq!(n, 100);
        assert_eq!(out, data);
    }

    #[test]
    fn read_past_eof_is_short() {
        let dir = tempdir().unwrap();
        let bf = make_blockfile(dir.path(), 4, 64, 100);
        let mut out = vec![0xffu8; 32];
        let n = bf.read_at(90, &mut out).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&out[..10], &[0u8; 10]);
    }

    #[test]
    fn write_past_eof_extends_size() {
        let dir = tempdir().unwrap();
        let bf = make_blockfile(dir.path(), 4, 64, 50);
        assert_eq!(bf.size(), 50);
        bf.write_at(200, b"tail").unwrap();
        assert_eq!(bf.size(), 204);
    }

    #[test]
    fn shrink_then_regrow_does_not_resurrect_stale_tail() {
        let dir = tempdir().unwrap();
        let bf = make_blockfile(dir.path(), 4, 64, 256);
        bf.write_at(0, &vec![0xAAu8; 256]).unwrap();

        bf.truncate(70).unwrap();
        assert_eq!(bf.size(), 70);

        bf.truncate(256).unwrap();
        assert_eq!(bf.size(), 256);

        let mut out = vec![0u8; 256];
        let n = bf.read_at(0, &mut out).unwrap();
        assert_eq!(n, 256);
        assert_eq!(&out[..70], &[0xAAu8; 70]);
        assert_eq!(&out[70..], &[0u8; 186]);
    }

    #[test]
    fn truncate_to_zero_frees_every_chunk() {
        let dir = tempdir().unwrap();
        let bf = make_blockfile(dir.path(), 4, 64, 256);
        bf.write_at(0, &vec![1u8; 256]).unwrap();
        bf.truncate(0).unwrap();
        assert_eq!(bf.size(), 0);
        bf.truncate(64).unwrap();
        let mut out = vec![0xffu8; 64];
        let n = bf.read_at(0, &mut out).unwrap();
        assert_eq!(n, 64);
        assert_eq!(out, vec![0u8; 64]);
    }
}

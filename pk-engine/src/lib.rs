//! `ChunkEngine`: the stateless façade assembling the codec, keyring,
//! local cache, hoard cache, Modified store, and origin fetch into
//! `get_chunk`/`put_chunk` (spec §4.5). "Stateless" means it holds no
//! chunk data of its own between calls beyond the Modified overlay —
//! everything else it touches is one of its collaborators.

mod modified_store;

use std::sync::atomic::{AtomicU64, Ordering};

use openssl::hash::{hash, MessageDigest};

use pk_hoard_cache::HoardCache;
use pk_keyring::{KeyEntry, Keyring};
use pk_local_cache::LocalCache;
use pk_types::error::{ErrorKind, PkError};
use pk_types::{ChunkIndex, Compression, CryptoSuite};

pub use modified_store::ModifiedStore;

/// Fetches a byte range of the parcel's canonical (already chunk-encoded)
/// representation from the origin server. One implementation per
/// transport; tests use an in-memory stub.
pub trait ChunkFetcher: Send + Sync {
    fn fetch_range(&self, start: u64, len: usize) -> Result<Vec<u8>, PkError>;
}

/// Stream/stat hooks the engine drives as a side effect of chunk I/O.
/// Left as a trait (rather than a hard dependency on `pk-streams`) so the
/// engine doesn't need to know how bitmaps or counters are represented.
pub trait ChunkEvents: Send + Sync {
    fn on_read(&self, index: ChunkIndex, bytes: usize);
    fn on_write(&self, index: ChunkIndex, bytes: usize);
    /// A chunk's blob was just pulled from the origin (as opposed to
    /// served from Local/Hoard). Default no-op for implementors that
    /// don't track this.
    fn on_origin_fetch(&self, _index: ChunkIndex) {}
    /// A chunk now has a Modified-store entry overriding its keyring/
    /// Local content. Default no-op for implementors that don't track
    /// this.
    fn on_modified_overlay(&self, _index: ChunkIndex) {}
}

pub struct NoopEvents;

impl ChunkEvents for NoopEvents {
    fn on_read(&self, _index: ChunkIndex, _bytes: usize) {}
    fn on_write(&self, _index: ChunkIndex, _bytes: usize) {}
}

#[derive(Default)]
pub struct EngineStats {
    pub chunk_reads: AtomicU64,
    pub chunk_writes: AtomicU64,
    pub data_bytes_read: AtomicU64,
    pub data_bytes_written: AtomicU64,
}

pub struct ChunkEngine {
    keyring: Keyring,
    local: LocalCache,
    hoard: HoardCache,
    modified: ModifiedStore,
    fetcher: Box<dyn ChunkFetcher>,
    events: Box<dyn ChunkEvents>,
    chunk_size: u32,
    logical_size: u64,
    suite: CryptoSuite,
    stats: EngineStats,
}

fn hash_suite(suite: CryptoSuite, data: &[u8]) -> Result<Vec<u8>, PkError> {
    let digest = match suite {
        CryptoSuite::AesSha1 => MessageDigest::sha1(),
    };
    hash(digest, data)
        .map(|d| d.to_vec())
        .map_err(|e| PkError::with_source(ErrorKind::CallFail, "digest failed", e.into()))
}

impl ChunkEngine {
    pub fn new(
        keyring: Keyring,
        local: LocalCache,
        hoard: HoardCache,
        modified: ModifiedStore,
        fetcher: Box<dyn ChunkFetcher>,
        events: Box<dyn ChunkEvents>,
        chunk_size: u32,
        logical_size: u64,
        suite: CryptoSuite,
    ) -> Self {
        Self {
            keyring,
            local,
            hoard,
            modified,
            fetcher,
            events,
            chunk_size,
            logical_size,
            suite,
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    fn plaintext_len(&self, i: ChunkIndex) -> u64 {
        let start = i * self.chunk_size as u64;
        if start >= self.logical_size {
            return 0;
        }
        (self.logical_size - start).min(self.chunk_size as u64)
    }

    /// `get_chunk(i, out[0..C]) → usable_bytes` (spec §4.5). The Modified
    /// store is consulted first — a chunk it holds is this session's only
    /// authoritative copy, ahead of whatever the keyring/Local/Hoard/origin
    /// chain would otherwise resolve to.
    pub fn get_chunk(&mut self, i: ChunkIndex, out: &mut [u8]) -> Result<usize, PkError> {
        let expected_len = self.plaintext_len(i) as usize;

        let plaintext = if self.modified.is_modified(i) {
            let mut buf = vec![0u8; self.chunk_size as usize];
            self.modified.read(i, &mut buf)?;
            buf.truncate(expected_len);
            buf
        } else {
            let entry = self
                .keyring
                .get(i)?
                .ok_or_else(|| PkError::new(ErrorKind::NotFound, format!("no keyring entry for chunk {i}")))?;
            let blob = self.locate_blob(i, &entry)?;
            pk_codec::decode(&blob, None, &entry.key, entry.compression, expected_len, self.suite)?
        };

        let usable = plaintext.len().min(out.len());
        out[..usable].copy_from_slice(&plaintext[..usable]);
        self.stats.chunk_reads.fetch_add(1, Ordering::Relaxed);
        self.stats.data_bytes_read.fetch_add(usable as u64, Ordering::Relaxed);
        self.events.on_read(i, usable);
        Ok(usable)
    }

    /// LocalCache, then HoardCache, then origin (spec §4.5 steps 2-3) —
    /// reached only once `get_chunk` has already ruled out a Modified hit.
    fn locate_blob(&mut self, i: ChunkIndex, entry: &KeyEntry) -> Result<Vec<u8>, PkError> {
        if entry.length > 0 {
            let mut buf = vec![0u8; self.chunk_size as usize];
            let len = self.local.read(i, &mut buf)?;
            if len > 0 {
                buf.truncate(len as usize);
                return Ok(buf);
            }
        }

        if let Some(slot) = self.hoard.get(&entry.tag)? {
            let mut buf = vec![0u8; slot.length as usize];
            if self.hoard.read_blob(&slot, &mut buf).is_ok() {
                let actual_tag = hash_suite(self.suite, &buf)?;
                if actual_tag == entry.tag {
                    return Ok(buf);
                }
                self.hoard.invalidate(slot.offset_bytes, &entry.tag)?;
            }
        }

        let start = i * self.chunk_size as u64;
        let want = self.plaintext_len(i).max(1) as usize;
        // The origin serves the already-encoded blob; its on-wire length
        // isn't known ahead of fetch, so over-request a full chunk and let
        // the transport hand back whatever it actually has.
        let fetched = self.fetcher.fetch_range(start, want.max(self.chunk_size as usize))?;
        let actual_tag = hash_suite(self.suite, &fetched)?;
        if actual_tag != entry.tag {
            return Err(PkError::new(ErrorKind::TagMismatch, format!("origin fetch for chunk {i} failed tag check")));
        }
        self.hoard.put(&entry.tag, entry.compression, &fetched)?;
        self.events.on_origin_fetch(i);
        Ok(fetched)
    }

    /// `put_chunk(i, plain[0..C'])` (spec §4.5). A fresh encode supersedes
    /// any Modified-store snapshot for `i` — the keyring/Local pair is now
    /// the authoritative content, so the one-off override is cleared
    /// rather than left to shadow it on a later fault-in.
    pub fn put_chunk(&mut self, i: ChunkIndex, plain: &[u8], allowed: &[Compression]) -> Result<(), PkError> {
        let encoded = pk_codec::encode(plain, allowed, self.suite)?;
        self.local.write(i, &encoded.blob)?;
        self.modified.clear(i);

        self.keyring.transaction(|txn| {
            Keyring::put(
                txn,
                i,
                &KeyEntry {
                    tag: encoded.tag,
                    key: encoded.key,
                    compression: encoded.compression,
                    length: encoded.blob.len() as u32,
                },
            )
        })?;

        self.stats.chunk_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .data_bytes_written
            .fetch_add(encoded.blob.len() as u64, Ordering::Relaxed);
        self.events.on_write(i, encoded.blob.len());
        Ok(())
    }

    /// Removes chunk `i`'s keyring row so a later fetch/read falls back to
    /// `NOT_FOUND` (and, via the caller's zero-fill policy, to zero-fill)
    /// instead of resurrecting stale content. Used by truncate.
    pub fn forget_chunk(&mut self, i: ChunkIndex) -> Result<(), PkError> {
        self.keyring.transaction(|txn| Keyring::delete(txn, i))
    }

    /// Number of chunks actually resident in LocalCache, for `statfs`'s
    /// `bfree = N - count_valid` (spec §6.7). Deliberately not the
    /// keyring's row count: the keyring stays densely populated `0..N-1`
    /// for the life of a fully-encoded parcel, so it can't tell a valid
    /// (cached) chunk from one that's merely known-about.
    pub fn count_valid(&self) -> Result<u64, PkError> {
        self.local.count_valid()
    }

    /// Records `data` as chunk `i`'s Modified-store snapshot, so a later
    /// `get_chunk` serves it ahead of the keyring/Local/Hoard/origin chain.
    /// Used by `BlockFile::truncate`'s snapshot-before-free step.
    pub fn mark_modified(&mut self, i: ChunkIndex, data: &[u8]) -> Result<(), PkError> {
        self.modified.snapshot(i, data)?;
        self.events.on_modified_overlay(i);
        Ok(())
    }

    /// Drops chunk `i`'s Modified-store entry, once it's been freed by a
    /// regrow past the old size or otherwise no longer needs the override.
    pub fn clear_modified(&mut self, i: ChunkIndex) {
        self.modified.clear(i);
    }

    pub fn is_modified(&self, i: ChunkIndex) -> bool {
        self.modified.is_modified(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pk_keyring::Interrupt;
    use tempfile::tempdir;

    struct FailFetcher;
    impl ChunkFetcher for FailFetcher {
        fn fetch_range(&self, _start: u64, _len: usize) -> Result<Vec<u8>, PkError> {
            Err(PkError::new(ErrorKind::NetFail, "no origin in test"))
        }
    }

    fn make_engine(dir: &std::path::Path, n: u32, chunk_size: u32, logical_size: u64) -> ChunkEngine {
        let keyring = Keyring::create(dir.join("keyring.db"), Interrupt::new()).unwrap();
        let local = LocalCache::create(dir.join("local.img"), n, chunk_size).unwrap();
        let hoard = HoardCache::create(dir.join("hoard"), chunk_size, CryptoSuite::AesSha1).unwrap();
        let modified = ModifiedStore::create(dir.join("modified.img"), chunk_size).unwrap();
        ChunkEngine::new(
            keyring,
            local,
            hoard,
            modified,
            Box::new(FailFetcher),
            Box::new(NoopEvents),
            chunk_size,
            logical_size,
            CryptoSuite::AesSha1,
        )
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let mut engine = make_engine(dir.path(), 4, 256, 4 * 256);
        let plain = vec![5u8; 256];
        engine.put_chunk(0, &plain, &[Compression::Zlib, Compression::None]).unwrap();
        let mut out = vec![0u8; 256];
        let n = engine.get_chunk(0, &mut out).unwrap();
        assert_eq!(n, 256);
        assert_eq!(out, plain);
    }

    #[test]
    fn get_chunk_missing_keyring_row_fails_not_found() {
        let dir = tempdir().unwrap();
        let mut engine = make_engine(dir.path(), 4, 256, 4 * 256);
        let mut out = vec![0u8; 256];
        let err = engine.get_chunk(1, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn modified_store_entry_wins_over_keyring_content() {
        let dir = tempdir().unwrap();
        let mut engine = make_engine(dir.path(), 4, 256, 4 * 256);
        let plain = vec![5u8; 256];
        engine.put_chunk(0, &plain, &[Compression::None]).unwrap();

        engine.mark_modified(0, &[7u8; 256]).unwrap();
        assert!(engine.is_modified(0));

        let mut out = vec![0u8; 256];
        let n = engine.get_chunk(0, &mut out).unwrap();
        assert_eq!(n, 256);
        assert_eq!(out, vec![7u8; 256]);

        engine.clear_modified(0);
        let n = engine.get_chunk(0, &mut out).unwrap();
        assert_eq!(n, 256);
        assert_eq!(out, plain);
    }

    #[test]
    fn partial_last_chunk_clamps_to_logical_size() {
        let dir = tempdir().unwrap();
        let mut engine = make_engine(dir.path(), 1, 256, 100);
        let plain = vec![9u8; 100];
        engine.put_chunk(0, &plain, &[Compression::None]).unwrap();
        let mut out = vec![0u8; 256];
        let n = engine.get_chunk(0, &mut out).unwrap();
        assert_eq!(n, 100);
    }
}

//! In-RAM buffered chunk cache serving the FUSE read/write path (spec
//! §4.6). Dirty chunks are cleaned by a background thread bounded by
//! `DIRTY_WRITEBACK_DELAY`; reclaiming RAM for a fault-in may have to
//! clean the chunk it evicts first.
//!
//! Simplification versus the design note's per-entry condvar: waiters
//! block on one cache-wide condvar and recheck their own index's busy
//! bit on wakeup, which is the standard pattern for a small number of
//! hot entries and avoids a condvar-per-chunk allocation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pk_buildcfg::{DIRTY_WRITEBACK_DELAY_SECS, MAX_CACHE_DIV, MAX_CACHE_MULT};
use pk_types::error::{ErrorKind, PkError};
use pk_types::ChunkIndex;

/// Backend the writeback cache faults chunks in from and flushes dirty
/// chunks back to. Implemented by whatever owns a `ChunkEngine`.
pub trait ChunkBackend: Send + Sync {
    fn fault_in(&self, index: ChunkIndex, buf: &mut [u8]) -> Result<usize, PkError>;
    fn flush(&self, index: ChunkIndex, data: &[u8]) -> Result<(), PkError>;
}

/// `allocatable = RAM_MB * 2^20 / C` (spec §4.6). Errors if zero, or if it
/// exceeds `MAX_CACHE_MULT/MAX_CACHE_DIV` of physical RAM.
pub fn ram_quota_chunks(ram_mb: u64, chunk_size: u32) -> Result<u64, PkError> {
    let allocatable = ram_mb.saturating_mul(1 << 20) / chunk_size as u64;
    if allocatable == 0 {
        return Err(PkError::new(ErrorKind::InvalidArgument, "RAM quota too small for one chunk"));
    }
    let policy_max = max_policy_chunks(chunk_size)?;
    if allocatable > policy_max {
        return Err(PkError::new(
            ErrorKind::InvalidArgument,
            format!("requested cache of {allocatable} chunks exceeds policy max of {policy_max}"),
        ));
    }
    Ok(allocatable)
}

fn max_policy_chunks(chunk_size: u32) -> Result<u64, PkError> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let phys_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size <= 0 || phys_pages <= 0 {
        return Err(PkError::new(ErrorKind::CallFail, "sysconf(_SC_PHYS_PAGES) failed"));
    }
    let phys_bytes = page_size as u64 * phys_pages as u64;
    Ok(phys_bytes * MAX_CACHE_MULT / MAX_CACHE_DIV / chunk_size as u64)
}

#[derive(Default)]
struct Entry {
    data: Option<Vec<u8>>,
    dirty_time: Option<Instant>,
    busy: bool,
    waiters: u32,
    error: bool,
}

struct Inner {
    entries: HashMap<ChunkIndex, Entry>,
    lru: VecDeque<ChunkIndex>,
    dirty_queue: VecDeque<ChunkIndex>,
    allocatable: u64,
    shutdown: bool,
}

pub struct WritebackCache {
    inner: Mutex<Inner>,
    busy_cv: Condvar,
    reclaimable_cv: Condvar,
    cleaner_cv: Condvar,
    backend: Arc<dyn ChunkBackend>,
    chunk_size: u32,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl WritebackCache {
    pub fn spawn(chunk_size: u32, allocatable: u64, backend: Arc<dyn ChunkBackend>) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: VecDeque::new(),
                dirty_queue: VecDeque::new(),
                allocatable,
                shutdown: false,
            }),
            busy_cv: Condvar::new(),
            reclaimable_cv: Condvar::new(),
            cleaner_cv: Condvar::new(),
            backend,
            chunk_size,
            cleaner: Mutex::new(None),
        });
        let weak: Weak<WritebackCache> = Arc::downgrade(&cache);
        let handle = std::thread::Builder::new()
            .name("pk-writeback-cleaner".into())
            .spawn(move || cleaner_loop(weak))
            .expect("spawn writeback cleaner thread");
        *cache.cleaner.lock().unwrap() = Some(handle);
        cache
    }

    /// Flushes every dirty chunk and stops the cleaner thread. Call on
    /// clean unmount before closing the local cache / keyring.
    pub fn shutdown(&self) -> Result<(), PkError> {
        let pending: Vec<ChunkIndex> = {
            let mut inner = self.inner.lock().unwrap();
            inner.shutdown = true;
            inner.dirty_queue.iter().copied().collect()
        };
        self.cleaner_cv.notify_all();
        for i in pending {
            self.clean_entry(i)?;
        }
        if let Some(handle) = self.cleaner.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn acquire(&self, i: ChunkIndex) -> EntryGuard<'_> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let busy = inner.entries.get(&i).map(|e| e.busy).unwrap_or(false);
            if !busy {
                inner.lru.retain(|&x| x != i);
                let entry = inner.entries.entry(i).or_insert_with(Entry::default);
                entry.busy = true;
                break;
            }
            if let Some(entry) = inner.entries.get_mut(&i) {
                entry.waiters += 1;
            }
            inner = self.busy_cv.wait(inner).unwrap();
        }
        EntryGuard { cache: self, index: i }
    }

    fn release(&self, i: ChunkIndex) {
        let mut inner = self.inner.lock().unwrap();
        let mut notify = false;
        let mut drop_entry = false;
        let mut push_lru = false;
        if let Some(entry) = inner.entries.get_mut(&i) {
            entry.busy = false;
            if entry.waiters > 0 {
                entry.waiters -= 1;
                notify = true;
            } else if entry.data.is_none() {
                drop_entry = true;
            } else {
                push_lru = true;
            }
        }
        if drop_entry {
            inner.entries.remove(&i);
        }
        if push_lru {
            inner.lru.push_back(i);
        }
        drop(inner);
        if notify {
            self.busy_cv.notify_all();
        }
        self.reclaimable_cv.notify_all();
    }

    /// Reads the full chunk buffer, faulting it in first if necessary.
    pub fn read(&self, i: ChunkIndex, out: &mut [u8]) -> Result<usize, PkError> {
        let guard = self.acquire(i);
        let needs_fault = {
            let inner = self.inner.lock().unwrap();
            inner.entries.get(&i).map(|e| e.data.is_none()).unwrap_or(true)
        };
        if needs_fault {
            self.fault_in(i)?;
        }
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(&i).unwrap();
        if entry.error {
            return Err(PkError::new(ErrorKind::IoErr, format!("chunk {i} has a sticky fault-in error")));
        }
        let data = entry.data.as_ref().expect("fault_in populates data on success");
        let n = data.len().min(out.len());
        out[..n].copy_from_slice(&data[..n]);
        drop(inner);
        drop(guard);
        Ok(n)
    }

    /// Faults the chunk in (if needed) and lets `f` mutate the in-RAM
    /// buffer in place; marks the chunk dirty afterward.
    pub fn write_with(&self, i: ChunkIndex, f: impl FnOnce(&mut [u8])) -> Result<(), PkError> {
        let guard = self.acquire(i);
        let needs_fault = {
            let inner = self.inner.lock().unwrap();
            inner.entries.get(&i).map(|e| e.data.is_none()).unwrap_or(true)
        };
        if needs_fault {
            self.fault_in(i)?;
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(&i).unwrap();
        if entry.error {
            return Err(PkError::new(ErrorKind::IoErr, format!("chunk {i} has a sticky fault-in error")));
        }
        let data = entry.data.as_mut().expect("fault_in populates data on success");
        f(data);
        let was_clean = entry.dirty_time.is_none();
        entry.dirty_time = Some(Instant::now());
        if was_clean {
            inner.dirty_queue.push_back(i);
        }
        drop(inner);
        drop(guard);
        self.cleaner_cv.notify_all();
        Ok(())
    }

    /// Fault-in per spec §4.6: allocate from quota if available, else
    /// reclaim the LRU head (cleaning it first if dirty).
    fn fault_in(&self, i: ChunkIndex) -> Result<(), PkError> {
        let mut buf;
        {
            let mut inner = self.inner.lock().unwrap();
            loop {
                if inner.allocatable > 0 {
                    inner.allocatable -= 1;
                    buf = vec![0u8; self.chunk_size as usize];
                    break;
                }
                if let Some(victim) = inner.lru.pop_front() {
                    let victim_dirty = inner
                        .entries
                        .get(&victim)
                        .map(|e| e.dirty_time.is_some())
                        .unwrap_or(false);
                    if let Some(v) = inner.entries.get_mut(&victim) {
                        v.busy = true;
                    }
                    drop(inner);
                    if victim_dirty {
                        self.clean_entry(victim)?;
                    }
                    let mut inner2 = self.inner.lock().unwrap();
                    let victim_entry = inner2.entries.remove(&victim);
                    inner = inner2;
                    buf = victim_entry.and_then(|e| e.data).unwrap_or_default();
                    if buf.len() != self.chunk_size as usize {
                        buf = vec![0u8; self.chunk_size as usize];
                    }
                    break;
                }
                inner = self.reclaimable_cv.wait(inner).unwrap();
            }
        }

        let result = self.backend.fault_in(i, &mut buf);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.entry(i).or_insert_with(Entry::default);
        match result {
            Ok(_) => entry.data = Some(buf),
            Err(err) => {
                log::error!("fault-in failed for chunk {i}: {err}");
                entry.error = true;
                inner.allocatable += 1;
            }
        }
        Ok(())
    }

    /// Flushes one dirty chunk's buffer to the backend and clears its
    /// dirty state. Used both by eviction and by the background cleaner.
    fn clean_entry(&self, i: ChunkIndex) -> Result<(), PkError> {
        let data = {
            let inner = self.inner.lock().unwrap();
            inner.entries.get(&i).and_then(|e| e.data.clone())
        };
        if let Some(data) = data {
            self.backend.flush(i, &data)?;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&i) {
            entry.dirty_time = None;
        }
        inner.dirty_queue.retain(|&x| x != i);
        Ok(())
    }

    /// Drops any cached buffer for chunk `i` without flushing it. Used by
    /// truncate once a chunk's keyring row has been explicitly removed, so
    /// a stale in-RAM copy can't be read back or re-flushed afterward.
    pub fn evict(&self, i: ChunkIndex) {
        let guard = self.acquire(i);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get_mut(&i) {
                if entry.data.take().is_some() {
                    inner.allocatable += 1;
                }
                entry.dirty_time = None;
            }
            inner.dirty_queue.retain(|&x| x != i);
        }
        drop(guard);
    }

    /// For tests/inspection: whether chunk `i` currently has dirty data.
    pub fn is_dirty(&self, i: ChunkIndex) -> bool {
        self.inner.lock().unwrap().entries.get(&i).map(|e| e.dirty_time.is_some()).unwrap_or(false)
    }
}

struct EntryGuard<'a> {
    cache: &'a WritebackCache,
    index: ChunkIndex,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.cache.release(self.index);
    }
}

fn cleaner_loop(weak: Weak<WritebackCache>) {
    let delay = Duration::from_secs(DIRTY_WRITEBACK_DELAY_SECS);
    loop {
        let cache = match weak.upgrade() {
            Some(c) => c,
            None => return,
        };
        let mut inner = cache.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        let head = inner.dirty_queue.front().copied();
        let (wait_for, head_index) = match head {
            None => (Duration::from_secs(3600), None),
            Some(i) => {
                let dirty_since = inner.entries.get(&i).and_then(|e| e.dirty_time);
                match dirty_since {
                    Some(t) => {
                        let due = t + delay;
                        let now = Instant::now();
                        (due.saturating_duration_since(now), Some(i))
                    }
                    None => (Duration::from_millis(0), Some(i)),
                }
            }
        };
        let (guard, timeout_result) = cache.cleaner_cv.wait_timeout(inner, wait_for).unwrap();
        inner = guard;
        if inner.shutdown {
            return;
        }
        if timeout_result.timed_out() {
            if let Some(i) = head_index {
                drop(inner);
                if let Err(err) = cache.clean_entry(i) {
                    log::error!("writeback cleaner failed to flush chunk {i}: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MemBackend {
        store: StdMutex<HashMap<ChunkIndex, Vec<u8>>>,
        flush_count: std::sync::atomic::AtomicU64,
    }

    impl ChunkBackend for MemBackend {
        fn fault_in(&self, index: ChunkIndex, buf: &mut [u8]) -> Result<usize, PkError> {
            let store = self.store.lock().unwrap();
            if let Some(data) = store.get(&index) {
                buf[..data.len()].copy_from_slice(data);
                Ok(data.len())
            } else {
                Ok(0)
            }
        }

        fn flush(&self, index: ChunkIndex, data: &[u8]) -> Result<(), PkError> {
            self.store.lock().unwrap().insert(index, data.to_vec());
            self.flush_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    fn make_backend(_chunk_size: u32) -> Arc<MemBackend> {
        Arc::new(MemBackend {
            store: StdMutex::new(HashMap::new()),
            flush_count: std::sync::atomic::AtomicU64::new(0),
        })
    }

    #[test]
    fn write_then_read_round_trips() {
        let backend = make_backend(16);
        let cache = WritebackCache::spawn(16, 4, backend.clone());
        cache.write_with(0, |buf| buf[..4].copy_from_slice(b"abcd")).unwrap();
        let mut out = vec![0u8; 16];
        cache.read(0, &mut out).unwrap();
        assert_eq!(&out[..4], b"abcd");
        cache.shutdown().unwrap();
    }

    #[test]
    fn shutdown_flushes_all_dirty_chunks() {
        let backend = make_backend(8);
        let cache = WritebackCache::spawn(8, 4, backend.clone());
        cache.write_with(1, |buf| buf[0] = 7).unwrap();
        assert!(cache.is_dirty(1));
        cache.shutdown().unwrap();
        assert_eq!(backend.store.lock().unwrap().get(&1).unwrap()[0], 7);
        assert_eq!(backend.flush_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn evict_drops_buffer_without_flushing() {
        let backend = make_backend(8);
        let cache = WritebackCache::spawn(8, 4, backend.clone());
        cache.write_with(2, |buf| buf[0] = 42).unwrap();
        cache.evict(2);
        assert!(!cache.is_dirty(2));
        assert!(backend.store.lock().unwrap().get(&2).is_none());
        cache.shutdown().unwrap();
    }

    #[test]
    fn quota_of_zero_is_rejected() {
        let err = ram_quota_chunks(0, 128 * 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}

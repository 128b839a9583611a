//! Per-process flat-file chunk cache (spec §4.3, §6.3). One file holds a
//! fixed-size header, a side-index of slot lengths, and `N` data slots of
//! `C` bytes each. Unlike the keyring there is no relational structure
//! here, so this stays a plain `pread`/`pwrite` file the way the chunk
//! store's own on-disk formats do, rather than reaching for `rusqlite`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use pk_buildcfg::{LOCAL_CACHE_FLAG_DAMAGED, LOCAL_CACHE_FLAG_DIRTY, LOCAL_CACHE_MAGIC, LOCAL_CACHE_VERSION};
use pk_types::error::{ErrorKind, PkError};

const HEADER_FIXED_LEN: usize = 21;
const MIN_DATA_START: u64 = 4096;

#[derive(Debug, Clone, Copy)]
pub struct LocalCacheHeader {
    pub magic: u32,
    pub entries: u32,
    pub offset_512: u32,
    pub flags: u32,
    pub version: u8,
}

impl LocalCacheHeader {
    fn data_start(&self) -> u64 {
        self.offset_512 as u64 * 512
    }

    fn to_bytes(self) -> [u8; HEADER_FIXED_LEN] {
        let mut buf = [0u8; HEADER_FIXED_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.entries.to_be_bytes());
        buf[8..12].copy_from_slice(&self.offset_512.to_be_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_be_bytes());
        // bytes 16..20 reserved, left zero
        buf[20] = self.version;
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_FIXED_LEN]) -> Self {
        Self {
            magic: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            entries: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            offset_512: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            flags: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            version: buf[20],
        }
    }
}

/// Whether flag-setting calls require proof of the parcel lock (spec
/// §4.3: "LocalCache requires its parcel lock to set flags").
pub trait ParcelLockProof {
    fn holds_parcel_lock(&self) -> bool;
}

pub struct LocalCache {
    file: File,
    header: LocalCacheHeader,
    chunk_size: u32,
    index_offset: u64,
}

impl LocalCache {
    fn index_slot_offset(index_offset: u64, i: u64) -> u64 {
        index_offset + i * 4
    }

    /// `open(path)`: parses the header, verifies magic/version, reconciles
    /// `entries` with `expected_n`.
    pub fn open(path: impl AsRef<Path>, expected_n: u32) -> Result<Self, PkError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let mut raw = [0u8; HEADER_FIXED_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;
        let header = LocalCacheHeader::from_bytes(&raw);
        if header.magic != LOCAL_CACHE_MAGIC {
            return Err(PkError::new(ErrorKind::BadFormat, "local cache: bad magic"));
        }
        if header.version != LOCAL_CACHE_VERSION {
            return Err(PkError::new(ErrorKind::BadFormat, "local cache: unsupported version"));
        }
        if header.entries != expected_n {
            return Err(PkError::new(
                ErrorKind::BadFormat,
                format!("local cache has {} entries, parcel expects {expected_n}", header.entries),
            ));
        }
        Ok(Self {
            file,
            header,
            chunk_size: 0, // filled in by caller via set_chunk_size, since the file format doesn't carry C
            index_offset: HEADER_FIXED_LEN as u64,
        })
    }

    pub fn set_chunk_size(&mut self, chunk_size: u32) {
        self.chunk_size = chunk_size;
    }

    /// `create(path, n, c)`: writes the header, preallocates `data_start + n*c`
    /// bytes (`fallocate` where supported, else `set_len`), clears DIRTY/DAMAGED.
    pub fn create(path: impl AsRef<Path>, n: u32, chunk_size: u32) -> Result<Self, PkError> {
        let index_bytes = n as u64 * 4;
        let min_data_start = (HEADER_FIXED_LEN as u64 + index_bytes + 511) / 512 * 512;
        let data_start = min_data_start.max(MIN_DATA_START);
        let header = LocalCacheHeader {
            magic: LOCAL_CACHE_MAGIC,
            entries: n,
            offset_512: (data_start / 512) as u32,
            flags: 0,
            version: LOCAL_CACHE_VERSION,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let total_len = data_start + n as u64 * chunk_size as u64;
        preallocate(&file, total_len)?;

        file.write_all_at(&header.to_bytes(), 0)?;
        let zero_index = vec![0u8; index_bytes as usize];
        file.write_all_at(&zero_index, HEADER_FIXED_LEN as u64)?;
        file.sync_all()?;

        Ok(Self {
            file,
            header,
            chunk_size,
            index_offset: HEADER_FIXED_LEN as u64,
        })
    }

    /// `pread` at `offset + i*C`, filling `buf` up to the recorded slot length.
    pub fn read(&self, i: u64, buf: &mut [u8]) -> Result<u32, PkError> {
        let slot_len = self.slot_len(i)?;
        let n = (slot_len as usize).min(buf.len());
        let offset = self.header.data_start() + i * self.chunk_size as u64;
        self.file.read_exact_at(&mut buf[..n], offset)?;
        Ok(slot_len)
    }

    /// `write(i, buf[0..l])`: always writes a full `C` bytes (zero-padded)
    /// to keep the file non-sparse, then upserts the slot length.
    pub fn write(&mut self, i: u64, buf: &[u8]) -> Result<(), PkError> {
        if buf.len() > self.chunk_size as usize {
            return Err(PkError::new(ErrorKind::InvalidArgument, "write exceeds chunk size"));
        }
        let mut padded = vec![0u8; self.chunk_size as usize];
        padded[..buf.len()].copy_from_slice(buf);
        let offset = self.header.data_start() + i * self.chunk_size as u64;
        self.file.write_all_at(&padded, offset)?;
        self.set_slot_len(i, buf.len() as u32)?;
        Ok(())
    }

    fn slot_len(&self, i: u64) -> Result<u32, PkError> {
        let mut raw = [0u8; 4];
        self.file
            .read_exact_at(&mut raw, Self::index_slot_offset(self.index_offset, i))?;
        Ok(u32::from_be_bytes(raw))
    }

    fn set_slot_len(&self, i: u64, len: u32) -> Result<(), PkError> {
        self.file
            .write_all_at(&len.to_be_bytes(), Self::index_slot_offset(self.index_offset, i))?;
        Ok(())
    }

    fn set_header_flags(&mut self, flags: u32) -> Result<(), PkError> {
        self.header.flags = flags;
        self.file.write_all_at(&self.header.to_bytes(), 0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Sets a header flag, write-through `fsync`ed. Refused without proof
    /// of the parcel lock (spec §4.3).
    pub fn set_flag(&mut self, flag: u32, lock: &impl ParcelLockProof) -> Result<(), PkError> {
        if !lock.holds_parcel_lock() {
            return Err(PkError::new(ErrorKind::Busy, "set_flag requires the parcel lock"));
        }
        let flags = self.header.flags | flag;
        self.set_header_flags(flags)
    }

    pub fn clear_flag(&mut self, flag: u32, lock: &impl ParcelLockProof) -> Result<(), PkError> {
        if !lock.holds_parcel_lock() {
            return Err(PkError::new(ErrorKind::Busy, "clear_flag requires the parcel lock"));
        }
        let flags = self.header.flags & !flag;
        self.set_header_flags(flags)
    }

    pub fn is_dirty(&self) -> bool {
        self.header.flags & LOCAL_CACHE_FLAG_DIRTY != 0
    }

    pub fn is_damaged(&self) -> bool {
        self.header.flags & LOCAL_CACHE_FLAG_DAMAGED != 0
    }

    pub fn entries(&self) -> u32 {
        self.header.entries
    }

    /// Number of slots with a non-zero recorded length, i.e. chunks
    /// actually resident in this cache (as opposed to the keyring's total
    /// row count, which stays dense even for chunks long since evicted
    /// from here). Used for `statfs`'s `bfree = N - count_valid`.
    pub fn count_valid(&self) -> Result<u64, PkError> {
        let mut raw = vec![0u8; self.header.entries as usize * 4];
        self.file.read_exact_at(&mut raw, self.index_offset)?;
        Ok(raw.chunks_exact(4).filter(|c| u32::from_be_bytes(c.try_into().unwrap()) > 0).count() as u64)
    }
}

#[cfg(unix)]
fn preallocate(file: &File, len: u64) -> Result<(), PkError> {
    let fd = file.as_raw_fd();
    match nix::fcntl::posix_fallocate(fd, 0, len as libc::off_t) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EOPNOTSUPP) | Err(nix::errno::Errno::ENOSYS) => {
            file.set_len(len).map_err(PkError::from)
        }
        Err(e) => Err(PkError::with_source(
            ErrorKind::IoErr,
            "posix_fallocate failed",
            e.into(),
        )),
    }
}

struct AlwaysLocked;

impl ParcelLockProof for AlwaysLocked {
    fn holds_parcel_lock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_round_trips_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");
        {
            LocalCache::create(&path, 16, 4096).unwrap();
        }
        let mut cache = LocalCache::open(&path, 16).unwrap();
        cache.set_chunk_size(4096);
        assert_eq!(cache.entries(), 16);
        assert!(!cache.is_dirty());
        assert!(!cache.is_damaged());
    }

    #[test]
    fn write_then_read_round_trips_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");
        let mut cache = LocalCache::create(&path, 4, 128).unwrap();
        let payload = vec![0x5Au8; 60];
        cache.write(2, &payload).unwrap();
        let mut buf = vec![0u8; 128];
        let len = cache.read(2, &mut buf).unwrap();
        assert_eq!(len, 60);
        assert_eq!(&buf[..60], &payload[..]);
    }

    #[test]
    fn count_valid_reflects_written_slots_not_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");
        let mut cache = LocalCache::create(&path, 4, 128).unwrap();
        assert_eq!(cache.count_valid().unwrap(), 0);
        cache.write(0, b"a").unwrap();
        cache.write(2, b"b").unwrap();
        assert_eq!(cache.count_valid().unwrap(), 2);
    }

    #[test]
    fn set_flag_requires_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");
        let mut cache = LocalCache::create(&path, 4, 128).unwrap();
        struct NoLock;
        impl ParcelLockProof for NoLock {
            fn holds_parcel_lock(&self) -> bool {
                false
            }
        }
        let err = cache.set_flag(LOCAL_CACHE_FLAG_DIRTY, &NoLock).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        cache.set_flag(LOCAL_CACHE_FLAG_DIRTY, &AlwaysLocked).unwrap();
        assert!(cache.is_dirty());
    }
}

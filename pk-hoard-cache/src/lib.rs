//! Shared, content-addressed chunk pool (spec §4.4, §6.6). Metadata
//! (`parcels`, `chunks`, `refs`) lives in a `rusqlite` database; chunk
//! bytes live in a flat sibling data file addressed by sector-unit
//! offsets, the same split LocalCache draws between its header/index and
//! its data area.

pub mod lock;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use openssl::hash::{hash, MessageDigest};
use rusqlite::{params, Connection, OptionalExtension};

use lock::{HoardLock, LockKind};
use pk_buildcfg::{HOARD_REFILL_BATCH, HOARD_SCHEMA_VERSION, SECTOR_SIZE};
use pk_types::error::{ErrorKind, PkError};
use pk_types::{Compression, CryptoSuite};

pub struct SlotInfo {
    pub offset_bytes: u64,
    pub length: u32,
    pub compression: Compression,
}

/// One row of the `parcels` table (spec §6.6): identifies a parcel that
/// has chunks referenced in this hoard cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelRecord {
    pub parcel: i64,
    pub uuid: String,
    pub server: String,
    pub user: String,
    pub name: String,
}

pub struct HoardCache {
    db: Connection,
    data_file: File,
    chunk_size: u32,
    suite: CryptoSuite,
}

fn sectors_per_chunk(chunk_size: u32) -> u64 {
    chunk_size as u64 / SECTOR_SIZE
}

impl HoardCache {
    fn paths(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join("hoard.db"), dir.join("hoard.img"))
    }

    pub fn create(dir: impl AsRef<Path>, chunk_size: u32, suite: CryptoSuite) -> Result<Self, PkError> {
        if chunk_size as u64 % SECTOR_SIZE != 0 {
            return Err(PkError::new(ErrorKind::InvalidArgument, "chunk_size must be sector-aligned"));
        }
        std::fs::create_dir_all(dir.as_ref())?;
        let (db_path, data_path) = Self::paths(dir.as_ref());
        let db = Connection::open(&db_path)
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "create hoard db", e.into()))?;
        db.execute_batch(&format!(
            "PRAGMA user_version = {HOARD_SCHEMA_VERSION};
             CREATE TABLE parcels (
                 parcel INTEGER PRIMARY KEY,
                 uuid   TEXT UNIQUE,
                 server TEXT,
                 user   TEXT,
                 name   TEXT
             );
             CREATE TABLE chunks (
                 tag       BLOB UNIQUE,
                 offset    INTEGER UNIQUE NOT NULL,
                 length    INTEGER NOT NULL DEFAULT 0,
                 crypto    INTEGER NOT NULL DEFAULT 0,
                 allocated INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX chunks_allocated ON chunks(allocated, offset);
             CREATE TABLE refs (parcel INTEGER, tag BLOB);
             CREATE UNIQUE INDEX refs_constraint ON refs(parcel, tag);
             CREATE INDEX refs_bytag ON refs(tag, parcel);
             CREATE TEMP TABLE slot_cache (
                 offset    INTEGER PRIMARY KEY,
                 tag       BLOB,
                 length    INTEGER NOT NULL DEFAULT 0,
                 crypto    INTEGER NOT NULL DEFAULT 0,
                 populated INTEGER NOT NULL DEFAULT 0
             );"
        ))
        .map_err(|e| PkError::with_source(ErrorKind::Sql, "create hoard schema", e.into()))?;

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;

        Ok(Self {
            db,
            data_file,
            chunk_size,
            suite,
        })
    }

    pub fn open(dir: impl AsRef<Path>, chunk_size: u32, suite: CryptoSuite) -> Result<Self, PkError> {
        let (db_path, data_path) = Self::paths(dir.as_ref());
        let db = Connection::open(&db_path)
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "open hoard db", e.into()))?;
        let version: i64 = db
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "read hoard user_version", e.into()))?;
        if version != HOARD_SCHEMA_VERSION {
            return Err(PkError::new(
                ErrorKind::BadFormat,
                format!("hoard schema version {version}, expected {HOARD_SCHEMA_VERSION}"),
            ));
        }
        db.execute_batch(
            "CREATE TEMP TABLE slot_cache (
                 offset    INTEGER PRIMARY KEY,
                 tag       BLOB,
                 length    INTEGER NOT NULL DEFAULT 0,
                 crypto    INTEGER NOT NULL DEFAULT 0,
                 populated INTEGER NOT NULL DEFAULT 0
             );",
        )
        .map_err(|e| PkError::with_source(ErrorKind::Sql, "create slot_cache", e.into()))?;
        let data_file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        Ok(Self {
            db,
            data_file,
            chunk_size,
            suite,
        })
    }

    pub fn read_lock(&self) -> Result<HoardLock, PkError> {
        HoardLock::acquire(self.data_file.as_raw_fd(), LockKind::Read)
    }

    pub fn write_lock(&self) -> Result<HoardLock, PkError> {
        HoardLock::acquire(self.data_file.as_raw_fd(), LockKind::Write)
    }

    fn offset_bytes(&self, offset_sectors: u64) -> u64 {
        offset_sectors * SECTOR_SIZE
    }

    /// `SELECT offset, length WHERE tag = ?`, slot cache first then `chunks`.
    pub fn get(&self, tag: &[u8]) -> Result<Option<SlotInfo>, PkError> {
        let in_cache = self
            .db
            .query_row(
                "SELECT offset, length, crypto FROM slot_cache WHERE tag = ?1 AND populated = 1",
                params![tag],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .optional()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "get from slot_cache", e.into()))?;
        let row = match in_cache {
            Some(r) => Some(r),
            None => self
                .db
                .query_row(
                    "SELECT offset, length, crypto FROM chunks WHERE tag = ?1 AND allocated = 1",
                    params![tag],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
                )
                .optional()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "get from chunks", e.into()))?,
        };
        Ok(row.map(|(offset, length, crypto)| SlotInfo {
            offset_bytes: self.offset_bytes(offset as u64),
            length: length as u32,
            compression: Compression::from_tag(crypto).unwrap_or(Compression::None),
        }))
    }

    pub fn read_blob(&self, slot: &SlotInfo, buf: &mut [u8]) -> Result<(), PkError> {
        let n = slot.length as usize;
        if buf.len() < n {
            return Err(PkError::new(ErrorKind::BufferOverflow, "read_blob buffer too small"));
        }
        self.data_file.read_exact_at(&mut buf[..n], slot.offset_bytes)?;
        Ok(())
    }

    /// Pops one unused slot-cache row (`tag IS NULL`), refilling first if empty.
    fn reserve_slot(&mut self) -> Result<u64, PkError> {
        loop {
            let candidate: Option<i64> = self
                .db
                .query_row(
                    "SELECT offset FROM slot_cache WHERE tag IS NULL LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "reserve_slot query", e.into()))?;
            if let Some(offset) = candidate {
                return Ok(offset as u64);
            }
            self.refill_slot_cache()?;
        }
    }

    fn refill_slot_cache(&mut self) -> Result<(), PkError> {
        let txn = self
            .db
            .transaction()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill begin", e.into()))?;
        let offsets: Vec<i64> = {
            let mut stmt = txn
                .prepare("SELECT offset FROM chunks WHERE allocated = 0 LIMIT ?1")
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill select", e.into()))?;
            let rows = stmt
                .query_map(params![HOARD_REFILL_BATCH as i64], |row| row.get(0))
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill query_map", e.into()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill collect", e.into()))?
        };
        for offset in &offsets {
            txn.execute("UPDATE chunks SET allocated = 1 WHERE offset = ?1", params![offset])
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill mark allocated", e.into()))?;
            txn.execute(
                "INSERT INTO slot_cache (offset, tag, populated) VALUES (?1, NULL, 0)",
                params![offset],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill insert slot_cache", e.into()))?;
        }
        txn.commit()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "refill commit", e.into()))?;

        let got = offsets.len();
        if got < HOARD_REFILL_BATCH {
            self.extend_file(HOARD_REFILL_BATCH - got)?;
        }
        Ok(())
    }

    /// Appends `count` fresh slots at the next sector-aligned offsets past
    /// the current end of file.
    fn extend_file(&mut self, count: usize) -> Result<(), PkError> {
        let max_offset: Option<i64> = self
            .db
            .query_row("SELECT MAX(offset) FROM chunks", [], |row| row.get(0))
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "extend_file max offset", e.into()))?;
        let spc = sectors_per_chunk(self.chunk_size);
        let mut next_offset = match max_offset {
            Some(o) => o as u64 + spc,
            None => 0,
        };
        let txn = self
            .db
            .transaction()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "extend_file begin", e.into()))?;
        for _ in 0..count {
            txn.execute(
                "INSERT INTO chunks (tag, offset, length, crypto, allocated) VALUES (NULL, ?1, 0, 0, 1)",
                params![next_offset as i64],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "extend_file insert chunks", e.into()))?;
            txn.execute(
                "INSERT INTO slot_cache (offset, tag, populated) VALUES (?1, NULL, 0)",
                params![next_offset as i64],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "extend_file insert slot_cache", e.into()))?;
            next_offset += spc;
        }
        txn.commit()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "extend_file commit", e.into()))?;
        let new_len = self.offset_bytes(next_offset);
        self.data_file.set_len(new_len)?;
        Ok(())
    }

    /// `put`: dedup-checks `tag`, reserves a slot if new, writes the padded
    /// blob, and marks the slot-cache row populated (spec §4.4).
    pub fn put(&mut self, tag: &[u8], compression: Compression, blob: &[u8]) -> Result<(), PkError> {
        if self.get(tag)?.is_some() {
            return Ok(());
        }
        let offset = self.reserve_slot()?;
        let mut padded = vec![0u8; self.chunk_size as usize];
        if blob.len() > padded.len() {
            return Err(PkError::new(ErrorKind::InvalidArgument, "blob larger than chunk size"));
        }
        padded[..blob.len()].copy_from_slice(blob);
        self.data_file.write_all_at(&padded, self.offset_bytes(offset))?;
        self.db
            .execute(
                "UPDATE slot_cache SET tag = ?1, length = ?2, crypto = ?3, populated = 1 WHERE offset = ?4",
                params![tag, blob.len() as i64, compression.as_tag(), offset as i64],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "put update slot_cache", e.into()))?;
        Ok(())
    }

    /// Persists the slot cache into `chunks`; reserved-but-unpopulated rows
    /// release their reservation. Call on clean shutdown.
    pub fn flush_slot_cache(&mut self) -> Result<(), PkError> {
        let txn = self
            .db
            .transaction()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush begin", e.into()))?;
        {
            let mut stmt = txn
                .prepare("SELECT offset, tag, length, crypto, populated FROM slot_cache")
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush prepare", e.into()))?;
            let rows: Vec<(i64, Option<Vec<u8>>, i64, i64, i64)> = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush query_map", e.into()))?
                .collect::<Result<_, _>>()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush collect", e.into()))?;
            for (offset, tag, length, crypto, populated) in rows {
                if populated == 1 {
                    txn.execute(
                        "UPDATE chunks SET tag = ?1, length = ?2, crypto = ?3, allocated = 1 WHERE offset = ?4",
                        params![tag, length, crypto, offset],
                    )
                    .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush update populated", e.into()))?;
                } else {
                    txn.execute(
                        "UPDATE chunks SET tag = NULL, length = 0, crypto = 0, allocated = 0 WHERE offset = ?1",
                        params![offset],
                    )
                    .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush release reservation", e.into()))?;
                }
            }
        }
        txn.execute("DELETE FROM slot_cache", [])
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush clear slot_cache", e.into()))?;
        txn.commit()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "flush commit", e.into()))?;
        Ok(())
    }

    /// Invalidates a specific `(offset, tag)` pair (spec §4.4, §8 scenario
    /// 4: on tag mismatch the damaged slot ends with `tag = NULL, allocated = 0`).
    pub fn invalidate(&self, offset_bytes: u64, tag: &[u8]) -> Result<(), PkError> {
        let offset_sectors = offset_bytes / SECTOR_SIZE;
        self.db
            .execute(
                "UPDATE chunks SET tag = NULL, length = 0, allocated = 0 WHERE offset = ?1 AND tag = ?2",
                params![offset_sectors as i64, tag],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "invalidate", e.into()))?;
        Ok(())
    }

    /// `hoard_sync_refs` (spec §4.4).
    pub fn sync_refs(&self, parcel: i64, new_chunks: bool, tags: &[Vec<u8>]) -> Result<(), PkError> {
        let txn = self
            .db
            .unchecked_transaction()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs begin", e.into()))?;
        if new_chunks {
            for tag in tags {
                txn.execute(
                    "INSERT OR IGNORE INTO refs (parcel, tag) VALUES (?1, ?2)",
                    params![parcel, tag],
                )
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs insert", e.into()))?;
            }
        } else {
            let keep: HashSet<Vec<u8>> = tags.iter().cloned().collect();
            let existing: Vec<Vec<u8>> = {
                let mut stmt = txn
                    .prepare("SELECT tag FROM refs WHERE parcel = ?1")
                    .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs select", e.into()))?;
                stmt.query_map(params![parcel], |row| row.get(0))
                    .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs query_map", e.into()))?
                    .collect::<Result<_, _>>()
                    .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs collect", e.into()))?
            };
            for tag in &existing {
                if !keep.contains(tag) {
                    txn.execute(
                        "DELETE FROM refs WHERE parcel = ?1 AND tag = ?2",
                        params![parcel, tag],
                    )
                    .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs delete", e.into()))?;
                }
            }
            for tag in &keep {
                txn.execute(
                    "INSERT OR IGNORE INTO refs (parcel, tag) VALUES (?1, ?2)",
                    params![parcel, tag],
                )
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs reinsert", e.into()))?;
            }
        }
        txn.commit()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "sync_refs commit", e.into()))?;
        Ok(())
    }

    /// Registers (or reuses) the `parcels` row for `uuid`, returning the
    /// integer `parcel` id used as `refs.parcel`. Used by `upload`/`hoard`
    /// before the first `sync_refs` call for a given parcel.
    pub fn register_parcel(&self, uuid: &str, server: &str, user: &str, name: &str) -> Result<i64, PkError> {
        if let Some(existing) = self.find_parcel_id(uuid)? {
            return Ok(existing);
        }
        self.db
            .execute(
                "INSERT INTO parcels (parcel, uuid, server, user, name)
                 VALUES ((SELECT COALESCE(MAX(parcel), 0) + 1 FROM parcels), ?1, ?2, ?3, ?4)",
                params![uuid, server, user, name],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "register_parcel insert", e.into()))?;
        self.find_parcel_id(uuid)?
            .ok_or_else(|| PkError::new(ErrorKind::CallFail, "register_parcel: row vanished after insert"))
    }

    fn find_parcel_id(&self, uuid: &str) -> Result<Option<i64>, PkError> {
        self.db
            .query_row("SELECT parcel FROM parcels WHERE uuid = ?1", params![uuid], |row| row.get(0))
            .optional()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "find_parcel_id", e.into()))
    }

    /// `listhoard` (spec supplemented feature, `hoard_modes.c`'s `ls`):
    /// every parcel with chunks referenced in this hoard cache.
    pub fn list_parcels(&self) -> Result<Vec<ParcelRecord>, PkError> {
        let mut stmt = self
            .db
            .prepare("SELECT parcel, uuid, server, user, name FROM parcels ORDER BY parcel ASC")
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "list_parcels prepare", e.into()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ParcelRecord {
                    parcel: row.get(0)?,
                    uuid: row.get(1)?,
                    server: row.get(2)?,
                    user: row.get(3)?,
                    name: row.get(4)?,
                })
            })
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "list_parcels query_map", e.into()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "list_parcels collect", e.into()))
    }

    /// `rmhoard` (spec supplemented feature): drops `uuid`'s `parcels` row
    /// and its `refs`. The referenced chunks themselves are reclaimed by a
    /// later `gc`, not here, mirroring the original's two-step design.
    pub fn remove_parcel(&self, uuid: &str) -> Result<(), PkError> {
        let Some(id) = self.find_parcel_id(uuid)? else {
            return Err(PkError::new(ErrorKind::NotFound, format!("no parcel with uuid {uuid} in hoard cache")));
        };
        self.db
            .execute("DELETE FROM refs WHERE parcel = ?1", params![id])
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "remove_parcel refs", e.into()))?;
        self.db
            .execute("DELETE FROM parcels WHERE parcel = ?1", params![id])
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "remove_parcel row", e.into()))?;
        Ok(())
    }

    /// GC (spec §4.4): must be called under [`HoardCache::write_lock`].
    pub fn gc(&self) -> Result<u64, PkError> {
        let n = self
            .db
            .execute(
                "UPDATE chunks SET tag = NULL, allocated = 0 WHERE tag IS NOT NULL AND tag NOT IN (SELECT tag FROM refs)",
                [],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "gc", e.into()))?;
        Ok(n as u64)
    }

    /// Compaction (spec §4.4): must be called under [`HoardCache::write_lock`].
    /// Moves the highest-offset populated slot into the lowest-offset free
    /// slot until no such pair exists, then truncates the file.
    pub fn compact(&mut self) -> Result<u64, PkError> {
        let mut moves = 0u64;
        loop {
            let highest: Option<(i64, Vec<u8>, i64, i64)> = self
                .db
                .query_row(
                    "SELECT offset, tag, length, crypto FROM chunks WHERE allocated = 1 ORDER BY offset DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact select highest", e.into()))?;
            let Some((high_offset, tag, length, crypto)) = highest else {
                break;
            };
            let lowest: Option<i64> = self
                .db
                .query_row(
                    "SELECT offset FROM chunks WHERE allocated = 0 AND offset < ?1 ORDER BY offset ASC LIMIT 1",
                    params![high_offset],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact select lowest", e.into()))?;
            let Some(low_offset) = lowest else {
                break;
            };

            let mut buf = vec![0u8; self.chunk_size as usize];
            self.data_file.read_exact_at(&mut buf, self.offset_bytes(high_offset as u64))?;
            self.data_file.write_all_at(&buf, self.offset_bytes(low_offset as u64))?;

            let txn = self
                .db
                .transaction()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact begin", e.into()))?;
            txn.execute(
                "UPDATE chunks SET tag = ?1, length = ?2, crypto = ?3, allocated = 1 WHERE offset = ?4",
                params![tag, length, crypto, low_offset],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact update low", e.into()))?;
            txn.execute(
                "UPDATE chunks SET tag = NULL, length = 0, crypto = 0, allocated = 0 WHERE offset = ?1",
                params![high_offset],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact update high", e.into()))?;
            txn.commit()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact commit", e.into()))?;
            moves += 1;
        }

        let max_allocated: Option<i64> = self
            .db
            .query_row("SELECT MAX(offset) FROM chunks WHERE allocated = 1", [], |row| row.get(0))
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact max allocated", e.into()))?;
        let spc = sectors_per_chunk(self.chunk_size) as i64;
        if let Some(max_offset) = max_allocated {
            self.db
                .execute("DELETE FROM chunks WHERE offset > ?1", params![max_offset])
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact trim rows", e.into()))?;
            let new_len = self.offset_bytes((max_offset + spc) as u64);
            self.data_file.set_len(new_len)?;
        } else {
            self.db
                .execute("DELETE FROM chunks", [])
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "compact trim all", e.into()))?;
            self.data_file.set_len(0)?;
        }
        Ok(moves)
    }

    /// `checkhoard` (spec §4.4): returns a list of problems found (and
    /// already repaired in the database) rather than failing outright.
    pub fn checkhoard(&mut self, full: bool) -> Result<Vec<String>, PkError> {
        let mut issues = Vec::new();

        let bad_uuid_parcels: Vec<i64> = {
            let mut stmt = self
                .db
                .prepare("SELECT parcel, uuid FROM parcels")
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard parcels", e.into()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard parcels map", e.into()))?;
            let mut bad = Vec::new();
            for row in rows {
                let (parcel, uuid) = row.map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard row", e.into()))?;
                let canonical = uuid::Uuid::parse_str(&uuid)
                    .map(|u| u.hyphenated().to_string())
                    .unwrap_or_default();
                if canonical != uuid {
                    bad.push(parcel);
                }
            }
            bad
        };
        for parcel in &bad_uuid_parcels {
            issues.push(format!("parcel {parcel} has non-canonical uuid, dropped"));
            self.db
                .execute("DELETE FROM parcels WHERE parcel = ?1", params![parcel])
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard drop parcel", e.into()))?;
        }

        let spc = sectors_per_chunk(self.chunk_size) as i64;
        let offsets: Vec<i64> = {
            let mut stmt = self
                .db
                .prepare("SELECT offset FROM chunks ORDER BY offset ASC")
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard offsets", e.into()))?;
            stmt.query_map([], |row| row.get(0))
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard offsets map", e.into()))?
                .collect::<Result<_, _>>()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard offsets collect", e.into()))?
        };
        for (i, offset) in offsets.iter().enumerate() {
            if *offset != i as i64 * spc {
                issues.push(format!("chunk slot offsets have a gap at index {i}"));
                break;
            }
        }

        let populated: Vec<(i64, Vec<u8>, i64, i64)> = {
            let mut stmt = self
                .db
                .prepare("SELECT offset, tag, length, crypto FROM chunks WHERE allocated = 1 AND tag IS NOT NULL")
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard populated", e.into()))?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard populated map", e.into()))?
                .collect::<Result<_, _>>()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard populated collect", e.into()))?
        };
        for (offset, tag, length, crypto) in &populated {
            let hashlen = self.suite.hashlen();
            if tag.len() != hashlen {
                issues.push(format!("slot at offset {offset} has wrong tag length"));
                continue;
            }
            if *length == 0 || *length as u32 > self.chunk_size {
                issues.push(format!("slot at offset {offset} has invalid length {length}"));
                continue;
            }
            if Compression::from_tag(*crypto).is_none() {
                issues.push(format!("slot at offset {offset} has invalid compression tag {crypto}"));
                continue;
            }
            if full {
                let mut buf = vec![0u8; *length as usize];
                self.data_file.read_exact_at(&mut buf, self.offset_bytes(*offset as u64))?;
                let digest = match self.suite {
                    CryptoSuite::AesSha1 => MessageDigest::sha1(),
                };
                let actual = hash(digest, &buf)
                    .map_err(|e| PkError::with_source(ErrorKind::CallFail, "checkhoard digest", e.into()))?;
                if actual.as_ref() != tag.as_slice() {
                    issues.push(format!("slot at offset {offset} fails full-data hash check, invalidated"));
                    self.invalidate(self.offset_bytes(*offset as u64), tag)?;
                }
            }
        }

        let orphan_refs: i64 = self
            .db
            .execute(
                "DELETE FROM refs WHERE parcel NOT IN (SELECT parcel FROM parcels)",
                [],
            )
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "checkhoard orphan refs", e.into()))? as i64;
        if orphan_refs > 0 {
            issues.push(format!("deleted {orphan_refs} orphan refs rows"));
        }

        Ok(issues)
    }
}

impl Drop for HoardCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush_slot_cache() {
            log::error!("failed to flush hoard slot cache on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash_of(data: &[u8]) -> Vec<u8> {
        hash(MessageDigest::sha1(), data).unwrap().to_vec()
    }

    #[test]
    fn put_dedups_identical_tag() {
        let dir = tempdir().unwrap();
        let mut hoard = HoardCache::create(dir.path(), 4096, CryptoSuite::AesSha1).unwrap();
        let blob = vec![9u8; 100];
        let tag = hash_of(&blob);
        hoard.put(&tag, Compression::None, &blob).unwrap();
        hoard.put(&tag, Compression::None, &blob).unwrap();
        let slot = hoard.get(&tag).unwrap().unwrap();
        assert_eq!(slot.length, 100);
    }

    #[test]
    fn put_then_get_round_trips_blob() {
        let dir = tempdir().unwrap();
        let mut hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        let blob = vec![0x42u8; 50];
        let tag = hash_of(&blob);
        hoard.put(&tag, Compression::Zlib, &blob).unwrap();
        let slot = hoard.get(&tag).unwrap().unwrap();
        let mut buf = vec![0u8; 50];
        hoard.read_blob(&slot, &mut buf).unwrap();
        assert_eq!(buf, blob);
        assert_eq!(slot.compression, Compression::Zlib);
    }

    #[test]
    fn flush_then_reopen_persists_chunk() {
        let dir = tempdir().unwrap();
        let blob = vec![3u8; 40];
        let tag = hash_of(&blob);
        {
            let mut hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
            hoard.put(&tag, Compression::None, &blob).unwrap();
            hoard.flush_slot_cache().unwrap();
        }
        let hoard = HoardCache::open(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        let slot = hoard.get(&tag).unwrap().unwrap();
        assert_eq!(slot.length, 40);
    }

    #[test]
    fn gc_removes_unreferenced_chunks() {
        let dir = tempdir().unwrap();
        let mut hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        let blob = vec![1u8; 10];
        let tag = hash_of(&blob);
        hoard.put(&tag, Compression::None, &blob).unwrap();
        hoard.flush_slot_cache().unwrap();
        let removed = hoard.gc().unwrap();
        assert_eq!(removed, 1);
        assert!(hoard.get(&tag).unwrap().is_none());
    }

    #[test]
    fn sync_refs_additive_mode_keeps_existing_refs() {
        let dir = tempdir().unwrap();
        let hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        hoard.db.execute(
            "INSERT INTO parcels (parcel, uuid) VALUES (1, '00000000-0000-0000-0000-000000000000')",
            [],
        ).unwrap();
        let tag1 = vec![1u8; 20];
        let tag2 = vec![2u8; 20];
        hoard.sync_refs(1, true, &[tag1.clone()]).unwrap();
        hoard.sync_refs(1, true, &[tag2.clone()]).unwrap();
        let count: i64 = hoard.db.query_row("SELECT COUNT(*) FROM refs WHERE parcel = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn register_parcel_is_idempotent_and_lists() {
        let dir = tempdir().unwrap();
        let hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        let uuid = "4b6e34a1-6e1f-4f1a-9a2e-2a6c2a9b0a11";
        let id1 = hoard.register_parcel(uuid, "example.org", "alice", "demo").unwrap();
        let id2 = hoard.register_parcel(uuid, "example.org", "alice", "demo").unwrap();
        assert_eq!(id1, id2);
        let parcels = hoard.list_parcels().unwrap();
        assert_eq!(parcels.len(), 1);
        assert_eq!(parcels[0].uuid, uuid);
    }

    #[test]
    fn remove_parcel_drops_row_and_refs() {
        let dir = tempdir().unwrap();
        let hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        let uuid = "4b6e34a1-6e1f-4f1a-9a2e-2a6c2a9b0a11";
        let id = hoard.register_parcel(uuid, "example.org", "alice", "demo").unwrap();
        hoard.sync_refs(id, true, &[vec![9u8; 20]]).unwrap();
        hoard.remove_parcel(uuid).unwrap();
        assert!(hoard.list_parcels().unwrap().is_empty());
        let count: i64 = hoard.db.query_row("SELECT COUNT(*) FROM refs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn remove_parcel_unknown_uuid_fails_not_found() {
        let dir = tempdir().unwrap();
        let hoard = HoardCache::create(dir.path(), 256, CryptoSuite::AesSha1).unwrap();
        let err = hoard.remove_parcel("00000000-0000-0000-0000-000000000000").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

//! Transactional chunk-index keyring (spec §4.2, §6.5): for every chunk
//! index `i` in `0..N`, which `(tag, key, compression, length)` currently
//! represents it. Backed by SQLite via `rusqlite`, the same way the rest
//! of the corpus reaches for an embedded database instead of hand-rolling
//! one (the chunk store's own on-disk formats stay flat files; this is
//! genuinely relational and transactional, which is what SQLite is for).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use pk_buildcfg::{DB_BUSY_BACKOFF_MAX_MS, KEYRING_SCHEMA_VERSION};
use pk_types::error::{ErrorKind, PkError};
use pk_types::{ChunkIndex, Compression, CryptoSuite};

/// One keyring row: everything needed to fetch and decode a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub tag: Vec<u8>,
    pub key: Vec<u8>,
    pub compression: Compression,
    pub length: u32,
}

impl KeyEntry {
    pub fn validate(&self, suite: CryptoSuite) -> bool {
        self.tag.len() == suite.hashlen() && self.key.len() == suite.hashlen()
    }
}

/// Cooperative cancellation flag for the busy-wait-and-retry loop (spec
/// §4.2: "a signal flag interrupts retries").
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Keyring {
    conn: Connection,
    interrupt: Interrupt,
}

impl Keyring {
    /// Opens an existing keyring database, verifying `user_version`.
    pub fn open(path: impl AsRef<Path>, interrupt: Interrupt) -> Result<Self, PkError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "open keyring db", e.into()))?;
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "read user_version", e.into()))?;
        if version != KEYRING_SCHEMA_VERSION {
            return Err(PkError::new(
                ErrorKind::BadFormat,
                format!("keyring schema version {version}, expected {KEYRING_SCHEMA_VERSION}"),
            ));
        }
        Ok(Self { conn, interrupt })
    }

    /// Creates a fresh, empty keyring database with the schema from §6.5.
    pub fn create(path: impl AsRef<Path>, interrupt: Interrupt) -> Result<Self, PkError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "create keyring db", e.into()))?;
        conn.execute_batch(&format!(
            "PRAGMA user_version = {KEYRING_SCHEMA_VERSION};
             CREATE TABLE keys (
                 chunk       INTEGER PRIMARY KEY NOT NULL,
                 tag         BLOB    NOT NULL,
                 key         BLOB    NOT NULL,
                 compression INTEGER NOT NULL,
                 length      INTEGER NOT NULL
             );
             CREATE INDEX keys_tags ON keys(tag);"
        ))
        .map_err(|e| PkError::with_source(ErrorKind::Sql, "create keyring schema", e.into()))?;
        Ok(Self { conn, interrupt })
    }

    /// Runs `body` inside a transaction, retrying `SQLITE_BUSY` with a
    /// randomized backoff bounded by `DB_BUSY_BACKOFF_MAX_MS` rather than a
    /// fixed attempt count, per spec §4.2. Aborts early if `interrupt` is set.
    pub fn transaction<T>(
        &mut self,
        body: impl FnOnce(&rusqlite::Transaction) -> Result<T, PkError>,
    ) -> Result<T, PkError> {
        loop {
            if self.interrupt.is_set() {
                return Err(PkError::new(ErrorKind::Interrupted, "keyring transaction interrupted"));
            }
            let txn = self
                .conn
                .transaction()
                .map_err(|e| PkError::with_source(ErrorKind::Sql, "begin transaction", e.into()))?;
            match body(&txn) {
                Ok(value) => {
                    txn.commit()
                        .map_err(|e| PkError::with_source(ErrorKind::Sql, "commit transaction", e.into()))?;
                    return Ok(value);
                }
                Err(err) if is_busy(&err) => {
                    drop(txn);
                    let backoff = rand::thread_rng().gen_range(1..=DB_BUSY_BACKOFF_MAX_MS);
                    std::thread::sleep(Duration::from_millis(backoff));
                    continue;
                }
                Err(err) => {
                    let _ = txn.rollback();
                    return Err(err);
                }
            }
        }
    }

    pub fn get(&self, i: ChunkIndex) -> Result<Option<KeyEntry>, PkError> {
        self.conn
            .query_row(
                "SELECT tag, key, compression, length FROM keys WHERE chunk = ?1",
                params![i as i64],
                |row| {
                    let compression: i64 = row.get(2)?;
                    Ok(KeyEntry {
                        tag: row.get(0)?,
                        key: row.get(1)?,
                        compression: Compression::from_tag(compression).unwrap_or(Compression::None),
                        length: row.get::<_, i64>(3)? as u32,
                    })
                },
            )
            .optional()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "get keyring row", e.into()))
    }

    /// INSERT OR REPLACE, per spec §4.2. Must run inside a [`Keyring::transaction`].
    pub fn put(txn: &rusqlite::Transaction, i: ChunkIndex, entry: &KeyEntry) -> Result<(), PkError> {
        txn.execute(
            "INSERT OR REPLACE INTO keys (chunk, tag, key, compression, length) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                i as i64,
                entry.tag,
                entry.key,
                entry.compression.as_tag(),
                entry.length as i64,
            ],
        )
        .map_err(|e| PkError::with_source(ErrorKind::Sql, "put keyring row", e.into()))?;
        Ok(())
    }

    /// Removes a chunk's row entirely. Used when a truncate frees chunks
    /// beyond the new size, so a later regrowth finds no stale row and
    /// falls back to zero-fill instead of resurrecting old content.
    pub fn delete(txn: &rusqlite::Transaction, i: ChunkIndex) -> Result<(), PkError> {
        txn.execute("DELETE FROM keys WHERE chunk = ?1", params![i as i64])
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "delete keyring row", e.into()))?;
        Ok(())
    }

    pub fn count_valid(&self) -> Result<u64, PkError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM keys", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "count_valid", e.into()))
    }

    /// Number of rows whose `tag` differs from `previous`'s row at the same
    /// index (spec §4.2: "dirty" relative to the previous-version keyring).
    pub fn count_dirty(&self, previous: &Keyring) -> Result<u64, PkError> {
        let mut dirty = 0u64;
        for (index, entry) in self.iter_ordered()? {
            match previous.get(index)? {
                Some(prev) if prev.tag == entry.tag => {}
                _ => dirty += 1,
            }
        }
        Ok(dirty)
    }

    /// Rows ordered by chunk index. Does not itself check density; callers
    /// needing the §4.2 integrity property should use [`Keyring::validate`].
    pub fn iter_ordered(&self) -> Result<Vec<(ChunkIndex, KeyEntry)>, PkError> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk, tag, key, compression, length FROM keys ORDER BY chunk ASC")
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "prepare iter_ordered", e.into()))?;
        let rows = stmt
            .query_map([], |row| {
                let chunk: i64 = row.get(0)?;
                let compression: i64 = row.get(3)?;
                Ok((
                    chunk as ChunkIndex,
                    KeyEntry {
                        tag: row.get(1)?,
                        key: row.get(2)?,
                        compression: Compression::from_tag(compression).unwrap_or(Compression::None),
                        length: row.get::<_, i64>(4)? as u32,
                    },
                ))
            })
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "query iter_ordered", e.into()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| PkError::with_source(ErrorKind::Sql, "collect iter_ordered", e.into()))
    }

    /// Integrity checks used by `validate` (spec §4.2): dense `0..N-1` with
    /// no gaps or duplicates, correct tag/key lengths, and compression
    /// restricted to `required_compress`.
    pub fn validate(
        &self,
        expected_count: u64,
        suite: CryptoSuite,
        required_compress: &std::collections::HashSet<Compression>,
    ) -> Result<(), PkError> {
        let rows = self.iter_ordered()?;
        if rows.len() as u64 != expected_count {
            return Err(PkError::new(
                ErrorKind::BadFormat,
                format!("keyring has {} rows, expected {expected_count}", rows.len()),
            ));
        }
        for (expected_index, (index, entry)) in rows.iter().enumerate() {
            if *index != expected_index as ChunkIndex {
                return Err(PkError::new(
                    ErrorKind::BadFormat,
                    format!("keyring gap or duplicate: expected chunk {expected_index}, found {index}"),
                ));
            }
            if !entry.validate(suite) {
                return Err(PkError::new(
                    ErrorKind::BadFormat,
                    format!("chunk {index} has wrong tag/key length for suite"),
                ));
            }
            if !required_compress.contains(&entry.compression) {
                return Err(PkError::new(
                    ErrorKind::BadFormat,
                    format!("chunk {index} uses disallowed compression"),
                ));
            }
        }
        Ok(())
    }
}

fn is_busy(err: &PkError) -> bool {
    err.kind() == ErrorKind::Sql && err.to_string().to_lowercase().contains("busy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn sample_entry(byte: u8) -> KeyEntry {
        KeyEntry {
            tag: vec![byte; 20],
            key: vec![byte.wrapping_add(1); 20],
            compression: Compression::Zlib,
            length: 4096,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.db");
        let mut kr = Keyring::create(&path, Interrupt::new()).unwrap();
        let entry = sample_entry(7);
        kr.transaction(|txn| Keyring::put(txn, 3, &entry)).unwrap();
        assert_eq!(kr.get(3).unwrap(), Some(entry));
        assert_eq!(kr.get(4).unwrap(), None);
    }

    #[test]
    fn put_replaces_existing_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.db");
        let mut kr = Keyring::create(&path, Interrupt::new()).unwrap();
        kr.transaction(|txn| Keyring::put(txn, 0, &sample_entry(1))).unwrap();
        kr.transaction(|txn| Keyring::put(txn, 0, &sample_entry(2))).unwrap();
        assert_eq!(kr.get(0).unwrap(), Some(sample_entry(2)));
        assert_eq!(kr.count_valid().unwrap(), 1);
    }

    #[test]
    fn validate_detects_gap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.db");
        let mut kr = Keyring::create(&path, Interrupt::new()).unwrap();
        kr.transaction(|txn| Keyring::put(txn, 0, &sample_entry(1))).unwrap();
        kr.transaction(|txn| Keyring::put(txn, 2, &sample_entry(2))).unwrap();
        let required: HashSet<Compression> = [Compression::Zlib].into_iter().collect();
        let err = kr.validate(2, CryptoSuite::AesSha1, &required).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadFormat);
    }

    #[test]
    fn count_dirty_compares_against_previous_version() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old.db");
        let new_path = dir.path().join("new.db");
        let mut old = Keyring::create(&old_path, Interrupt::new()).unwrap();
        let mut new = Keyring::create(&new_path, Interrupt::new()).unwrap();
        old.transaction(|txn| Keyring::put(txn, 0, &sample_entry(1))).unwrap();
        old.transaction(|txn| Keyring::put(txn, 1, &sample_entry(2))).unwrap();
        new.transaction(|txn| Keyring::put(txn, 0, &sample_entry(1))).unwrap();
        new.transaction(|txn| Keyring::put(txn, 1, &sample_entry(9))).unwrap();
        assert_eq!(new.count_dirty(&old).unwrap(), 1);
    }
}

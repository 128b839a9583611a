//! Shared wiring: loading a parcel's configuration and assembling the
//! Keyring/LocalCache/HoardCache/ChunkEngine stack every data-touching
//! subcommand needs, so `main.rs`'s subcommand handlers only deal with
//! what's specific to their own mode.

use std::path::{Path, PathBuf};

use pk_engine::{ChunkEngine, ChunkEvents, ChunkFetcher, ModifiedStore, NoopEvents};
use pk_hoard_cache::HoardCache;
use pk_keyring::{Interrupt, Keyring};
use pk_local_cache::LocalCache;
use pk_types::error::PkError;
use pk_types::Parcel;

use crate::fetch::LocalDirFetcher;

pub fn load_parcel(parcel_dir: &Path) -> Result<Parcel, PkError> {
    Parcel::load(&parcel_dir.join("parcel.cfg"))
}

pub fn open_keyring(parcel_dir: &Path) -> Result<Keyring, PkError> {
    Keyring::open(parcel_dir.join("keyring.db"), Interrupt::new())
}

/// Opens the parcel's local cache file, creating it (sized for `parcel`)
/// if this is the first run against this parcel directory.
pub fn open_local_cache(parcel_dir: &Path, parcel: &Parcel) -> Result<LocalCache, PkError> {
    let path = parcel_dir.join("local.img");
    let mut cache = if path.exists() {
        LocalCache::open(&path, parcel.num_chunks as u32)?
    } else {
        LocalCache::create(&path, parcel.num_chunks as u32, parcel.chunk_size)?
    };
    cache.set_chunk_size(parcel.chunk_size);
    Ok(cache)
}

pub fn open_hoard(hoard_dir: &Path, parcel: &Parcel) -> Result<HoardCache, PkError> {
    if hoard_dir.join("hoard.db").exists() {
        HoardCache::open(hoard_dir, parcel.chunk_size, parcel.crypto)
    } else {
        HoardCache::create(hoard_dir, parcel.chunk_size, parcel.crypto)
    }
}

/// `ChunkEngine` always owns a `HoardCache` even when the user configured
/// no shared hoard; in that case this opens one in a throwaway per-run
/// directory so the engine's Hoard fallthrough step is simply always
/// empty, rather than making `pk-engine` carry an `Option` the spec's own
/// fallthrough order (Modified → Local → Hoard → Origin) doesn't have.
/// Callers must keep the returned `TempDir` alive as long as the engine.
pub fn open_hoard_or_scratch(
    hoard_dir: Option<&Path>,
    parcel: &Parcel,
) -> Result<(HoardCache, Option<tempfile::TempDir>), PkError> {
    match hoard_dir {
        Some(dir) => Ok((open_hoard(dir, parcel)?, None)),
        None => {
            let scratch = tempfile::tempdir()?;
            let hoard = HoardCache::create(scratch.path(), parcel.chunk_size, parcel.crypto)?;
            Ok((hoard, Some(scratch)))
        }
    }
}

/// Opens (truncating) the per-run Modified-store overlay file alongside
/// the parcel's other per-run state; `run` is the only subcommand whose
/// writes to it matter (via `BlockFile::truncate`).
pub fn open_modified_store(parcel_dir: &Path, parcel: &Parcel) -> Result<ModifiedStore, PkError> {
    ModifiedStore::create(parcel_dir.join("modified.img"), parcel.chunk_size)
}

/// A Modified store for subcommands that build an engine with no live
/// `run` session behind it (e.g. `hoard download`): nothing ever writes
/// to it, so its backing file can live in a throwaway directory instead
/// of the parcel's own.
pub fn scratch_modified_store(parcel: &Parcel) -> Result<(ModifiedStore, tempfile::TempDir), PkError> {
    let scratch = tempfile::tempdir()?;
    let modified = ModifiedStore::create(scratch.path().join("modified.img"), parcel.chunk_size)?;
    Ok((modified, scratch))
}

/// Builds the engine for `parcel`, sourcing absent chunks from the
/// directory named by the parcel's `RPATH` key. `events` lets `run` wire
/// the streams/stats hooks in; every other subcommand passes `NoopEvents`.
pub fn build_engine(
    parcel: &Parcel,
    keyring: Keyring,
    local: LocalCache,
    hoard: HoardCache,
    modified: ModifiedStore,
    events: Box<dyn ChunkEvents>,
) -> ChunkEngine {
    let fetcher: Box<dyn ChunkFetcher> =
        Box::new(LocalDirFetcher::new(PathBuf::from(&parcel.rpath), parcel.chunk_size, parcel.chunks_per_dir));
    ChunkEngine::new(
        keyring,
        local,
        hoard,
        modified,
        fetcher,
        events,
        parcel.chunk_size,
        parcel.logical_size(),
        parcel.crypto,
    )
}

pub fn noop_engine(
    parcel: &Parcel,
    keyring: Keyring,
    local: LocalCache,
    hoard: HoardCache,
    modified: ModifiedStore,
) -> ChunkEngine {
    build_engine(parcel, keyring, local, hoard, modified, Box::new(NoopEvents))
}

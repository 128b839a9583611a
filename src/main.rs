//! `parcelkeeper`: CLI entrypoint wiring the chunk-store crates together.
//! Subcommand shape follows the original daemon's mode table
//! (`examples/original_source/ISR/src/parcelkeeper/cmdline.c`) with the
//! hoard-directory-scoped modes (`hoard`, `listhoard`, `rmhoard`,
//! `gchoard`, `checkhoard`'s `--compact`) folded under `hoard <subcmd>`.

mod fetch;
mod parcel_lock;
mod setup;

use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use pk_blockfile::{BlockFile, EngineBackend};
use pk_buildcfg::{CANONICAL_CHUNK_SIZE, LOCAL_CACHE_FLAG_DAMAGED, LOCAL_CACHE_FLAG_DIRTY};
use pk_engine::ChunkEvents;
use pk_fuse::Session;
use pk_hoard_cache::HoardCache;
use pk_keyring::{Interrupt, Keyring};
use pk_streams::{BitmapGroup, StatsGroup, StreamEvents};
use pk_types::error::ErrorKind;
use pk_types::{Compression, CryptoSuite, Parcel};
use pk_writeback::{ram_quota_chunks, WritebackCache};

use parcel_lock::ParcelLock;

#[derive(Parser)]
#[command(name = "parcelkeeper", about = "Content-addressed chunk store and FUSE block device for VM images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a parcel's image as a FUSE block device and serve it.
    Run(RunArgs),
    /// Copy a parcel's locally-cached chunks into a destination tree for upload.
    Upload(UploadArgs),
    /// Operations scoped to a shared hoard cache directory.
    Hoard(HoardArgs),
    /// Print a summary of a parcel's (and optionally its hoard's) state.
    Examine(ExamineArgs),
    /// Check keyring/local-cache integrity; exit code reports dirty/damaged.
    Validate(ValidateArgs),
    /// Check a hoard cache's internal consistency.
    Checkhoard(CheckhoardArgs),
    /// Re-sync a parcel's chunk references against its hoard cache.
    Refresh(RefreshArgs),
    /// Encode/decode a raw disk image to/from a flat chunk directory.
    Disktool(DisktoolArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Parcel version directory (containing parcel.cfg, keyring.db, ...).
    #[arg(long)]
    parcel: PathBuf,
    /// Where to mount the parcel's virtual filesystem.
    mountpoint: PathBuf,
    /// Shared hoard cache directory; omit to run without one.
    #[arg(long)]
    hoard: Option<PathBuf>,
    /// In-RAM writeback cache quota, in megabytes.
    #[arg(long = "chunk-cache")]
    chunk_cache_mb: Option<u64>,
    /// Preferred compression for newly-written chunks.
    #[arg(long)]
    compression: Option<String>,
    #[arg(long = "allow-root")]
    allow_root: bool,
    #[arg(long = "single-thread")]
    single_thread: bool,
    /// Log to stderr instead of syslog.
    #[arg(long)]
    foreground: bool,
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    parcel: PathBuf,
    /// Destination directory to receive the parcel's encoded chunks.
    destdir: PathBuf,
    #[arg(long)]
    hoard: Option<PathBuf>,
}

#[derive(Args)]
struct HoardArgs {
    #[command(subcommand)]
    cmd: HoardCmd,
}

#[derive(Subcommand)]
enum HoardCmd {
    /// Download every chunk a parcel's keyring references into the hoard.
    Download(HoardDownloadArgs),
    /// Reclaim hoard slots with no surviving parcel reference.
    Gc(HoardDirArgs),
    /// Defragment the hoard's data file, reclaiming slack from `gc`.
    Compact(HoardDirArgs),
    /// List parcels with chunks referenced in the hoard.
    Ls(HoardDirArgs),
    /// Drop a parcel's references from the hoard (its chunks are reclaimed by a later `gc`).
    Rm(HoardRmArgs),
}

#[derive(Args)]
struct HoardDownloadArgs {
    #[arg(long)]
    parcel: PathBuf,
    #[arg(long)]
    hoard: PathBuf,
    /// Re-read every downloaded chunk back out of the hoard to confirm it stuck.
    #[arg(long)]
    check: bool,
}

#[derive(Args)]
struct HoardDirArgs {
    hoard: PathBuf,
    #[arg(long = "chunk-size", default_value_t = CANONICAL_CHUNK_SIZE)]
    chunk_size: u32,
}

#[derive(Args)]
struct HoardRmArgs {
    hoard: PathBuf,
    #[arg(long)]
    uuid: String,
    #[arg(long = "chunk-size", default_value_t = CANONICAL_CHUNK_SIZE)]
    chunk_size: u32,
}

#[derive(Args)]
struct ExamineArgs {
    #[arg(long)]
    parcel: PathBuf,
    #[arg(long)]
    hoard: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    parcel: PathBuf,
    /// Decode every cached chunk and verify hash(plain) == key.
    #[arg(long)]
    full: bool,
    /// On a `--full` mismatch, restore that chunk's row from `--previous`.
    #[arg(long)]
    splice: bool,
    #[arg(long)]
    previous: Option<PathBuf>,
}

#[derive(Args)]
struct CheckhoardArgs {
    hoard: PathBuf,
    #[arg(long = "chunk-size", default_value_t = CANONICAL_CHUNK_SIZE)]
    chunk_size: u32,
    /// Decode-verify every allocated slot, not just index consistency.
    #[arg(long)]
    full: bool,
    #[arg(long)]
    compact: bool,
}

#[derive(Args)]
struct RefreshArgs {
    #[arg(long)]
    parcel: PathBuf,
    #[arg(long)]
    hoard: Option<PathBuf>,
    /// Also reclaim now-unreferenced hoard slots after syncing.
    #[arg(long)]
    gc: bool,
}

#[derive(Args)]
struct DisktoolArgs {
    /// Import a raw image into the chunk directory.
    #[arg(long = "in")]
    import: Option<PathBuf>,
    /// Export the chunk directory back to a raw image.
    #[arg(long = "out")]
    export: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    directory: PathBuf,
    #[arg(long, default_value = "keyring")]
    keyring: String,
    #[arg(long = "chunksize", default_value_t = CANONICAL_CHUNK_SIZE)]
    chunk_size: u32,
    #[arg(long = "chunksperdir", default_value_t = 512)]
    chunksperdir: u32,
    #[arg(long, default_value = "zlib")]
    compression: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let foreground = match &cli.command {
        Command::Run(args) => args.foreground,
        _ => true,
    };
    init_logging(foreground);

    match dispatch(cli.command) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(foreground: bool) {
    if foreground {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else if syslog::init(syslog::Facility::LOG_DAEMON, log::LevelFilter::Info, Some("parcelkeeper")).is_err() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
}

fn dispatch(command: Command) -> anyhow::Result<i32> {
    match command {
        Command::Run(args) => cmd_run(args),
        Command::Upload(args) => cmd_upload(args),
        Command::Hoard(args) => match args.cmd {
            HoardCmd::Download(a) => cmd_hoard_download(a),
            HoardCmd::Gc(a) => cmd_hoard_gc(a),
            HoardCmd::Compact(a) => cmd_hoard_compact(a),
            HoardCmd::Ls(a) => cmd_hoard_ls(a),
            HoardCmd::Rm(a) => cmd_hoard_rm(a),
        },
        Command::Examine(args) => cmd_examine(args),
        Command::Validate(args) => cmd_validate(args),
        Command::Checkhoard(args) => cmd_checkhoard(args),
        Command::Refresh(args) => cmd_refresh(args),
        Command::Disktool(args) => cmd_disktool(args),
    }
}

fn open_bare_hoard(dir: &std::path::Path, chunk_size: u32) -> anyhow::Result<HoardCache> {
    let suite = CryptoSuite::AesSha1;
    Parcel::verify_chunk_size(chunk_size)?;
    if dir.join("hoard.db").exists() {
        Ok(HoardCache::open(dir, chunk_size, suite)?)
    } else {
        Ok(HoardCache::create(dir, chunk_size, suite)?)
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let parcel = setup::load_parcel(&args.parcel)?;
    let _lock = ParcelLock::acquire(&args.parcel.join("lockfile"))?;

    let keyring = setup::open_keyring(&args.parcel)?;
    let local = setup::open_local_cache(&args.parcel, &parcel)?;
    let (hoard, _hoard_scratch) = setup::open_hoard_or_scratch(args.hoard.as_deref(), &parcel)?;
    let modified = setup::open_modified_store(&args.parcel, &parcel)?;

    let bitmaps = Arc::new(BitmapGroup::new(parcel.num_chunks));
    let stats = Arc::new(StatsGroup::default());
    let events: Box<dyn ChunkEvents> = Box::new(StreamEvents {
        bitmaps: bitmaps.clone(),
        stats: stats.clone(),
    });
    let engine = setup::build_engine(&parcel, keyring, local, hoard, modified, events);

    let mut allowed = parcel.compress.clone();
    if let Some(preferred) = &args.compression {
        let preferred: Compression = preferred.parse()?;
        allowed.retain(|c| *c != preferred);
        allowed.insert(0, preferred);
    }

    let backend = Arc::new(EngineBackend::new(engine, allowed));
    let chunk_cache_mb = args.chunk_cache_mb.unwrap_or(32);
    let allocatable = ram_quota_chunks(chunk_cache_mb, parcel.chunk_size)?;
    let writeback = WritebackCache::spawn(parcel.chunk_size, allocatable, backend.clone());

    let image = Arc::new(BlockFile::new(backend, writeback, parcel.chunk_size, parcel.logical_size()));

    let options = if args.allow_root { OsStr::new("allow_root") } else { OsStr::new("") };
    let runtime = if args.single_thread {
        tokio::runtime::Builder::new_current_thread().enable_all().build()?
    } else {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?
    };

    log::info!("parcelkeeper starting in run mode on {}", args.mountpoint.display());
    runtime.block_on(async move {
        let session = Session::mount(image, parcel.chunk_size, parcel.num_chunks, bitmaps, stats, options, &args.mountpoint)?;
        session.await
    })?;
    Ok(0)
}

fn cmd_upload(args: UploadArgs) -> anyhow::Result<i32> {
    let parcel = setup::load_parcel(&args.parcel)?;
    let _lock = ParcelLock::acquire(&args.parcel.join("lockfile"))?;

    let keyring = setup::open_keyring(&args.parcel)?;
    let local = setup::open_local_cache(&args.parcel, &parcel)?;
    let uuid = parcel.uuid.to_string();

    let hoard = match &args.hoard {
        Some(dir) => Some(setup::open_hoard(dir, &parcel)?),
        None => None,
    };

    let entries = keyring.iter_ordered()?;
    let tags: Vec<Vec<u8>> = entries.iter().map(|(_, e)| e.tag.clone()).collect();

    let parcel_id = match &hoard {
        Some(hoard) => {
            let id = hoard.register_parcel(&uuid, &parcel.server, &parcel.user, &parcel.name)?;
            hoard.sync_refs(id, true, &tags)?;
            Some(id)
        }
        None => None,
    };

    fs::create_dir_all(&args.destdir)?;
    let mut buf = vec![0u8; parcel.chunk_size as usize];
    for (index, _entry) in &entries {
        let n = local.read(*index, &mut buf)?;
        fetch::put_blob(&args.destdir, *index, parcel.chunks_per_dir, &buf[..n as usize])?;
    }

    if let (Some(hoard), Some(id)) = (&hoard, parcel_id) {
        hoard.sync_refs(id, false, &tags)?;
    }

    log::info!("uploaded {} chunk(s) for parcel {uuid} to {}", entries.len(), args.destdir.display());
    Ok(0)
}

fn cmd_hoard_download(args: HoardDownloadArgs) -> anyhow::Result<i32> {
    let parcel = setup::load_parcel(&args.parcel)?;
    let keyring = setup::open_keyring(&args.parcel)?;
    let local = setup::open_local_cache(&args.parcel, &parcel)?;
    let hoard = setup::open_hoard(&args.hoard, &parcel)?;
    let (modified, _modified_scratch) = setup::scratch_modified_store(&parcel)?;
    let mut engine = setup::noop_engine(&parcel, keyring, local, hoard, modified);

    let mut buf = vec![0u8; parcel.chunk_size as usize];
    let mut fetched = 0u64;
    for index in 0..parcel.num_chunks {
        match engine.get_chunk(index, &mut buf) {
            Ok(_) => fetched += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    log::info!("hoard download: populated {fetched} chunk(s) from origin/local");

    if args.check {
        // Re-read every chunk once more; by now the engine's Local/Hoard
        // steps should satisfy all of them without touching the origin.
        for index in 0..parcel.num_chunks {
            if let Err(e) = engine.get_chunk(index, &mut buf) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
    }
    Ok(0)
}

fn cmd_hoard_gc(args: HoardDirArgs) -> anyhow::Result<i32> {
    let hoard = open_bare_hoard(&args.hoard, args.chunk_size)?;
    let freed = hoard.gc()?;
    log::info!("hoard gc: freed {freed} chunk slot(s)");
    Ok(0)
}

fn cmd_hoard_compact(args: HoardDirArgs) -> anyhow::Result<i32> {
    let mut hoard = open_bare_hoard(&args.hoard, args.chunk_size)?;
    let reclaimed = hoard.compact()?;
    log::info!("hoard compact: reclaimed {reclaimed} byte(s) of slack");
    Ok(0)
}

fn cmd_hoard_ls(args: HoardDirArgs) -> anyhow::Result<i32> {
    let hoard = open_bare_hoard(&args.hoard, args.chunk_size)?;
    for p in hoard.list_parcels()? {
        println!("{}\t{}\t{}@{}", p.uuid, p.name, p.user, p.server);
    }
    Ok(0)
}

fn cmd_hoard_rm(args: HoardRmArgs) -> anyhow::Result<i32> {
    let hoard = open_bare_hoard(&args.hoard, args.chunk_size)?;
    hoard.remove_parcel(&args.uuid)?;
    log::info!("removed parcel {} from hoard (chunks reclaimed by the next gc)", args.uuid);
    Ok(0)
}

fn cmd_examine(args: ExamineArgs) -> anyhow::Result<i32> {
    let parcel = setup::load_parcel(&args.parcel)?;

    println!("parcel {} ({})", parcel.name, parcel.uuid);
    println!("  chunk size:   {}", parcel.chunk_size);
    println!("  chunk count:  {}", parcel.num_chunks);

    let local_path = args.parcel.join("local.img");
    if local_path.exists() {
        let mut local = pk_local_cache::LocalCache::open(&local_path, parcel.num_chunks as u32)?;
        local.set_chunk_size(parcel.chunk_size);
        let valid = local.count_valid()?;
        println!("  valid chunks: {valid}/{}", parcel.num_chunks);
        println!("  local cache:  dirty={} damaged={}", local.is_dirty(), local.is_damaged());
    }

    if let Some(hoard_dir) = &args.hoard {
        let hoard = setup::open_hoard(hoard_dir, &parcel)?;
        let parcels = hoard.list_parcels()?;
        println!("hoard cache at {}: {} parcel(s) referenced", hoard_dir.display(), parcels.len());
        for p in parcels {
            println!("  {} ({}@{}) — {}", p.uuid, p.user, p.server, p.name);
        }
    }

    Ok(0)
}

fn cmd_validate(args: ValidateArgs) -> anyhow::Result<i32> {
    let parcel = setup::load_parcel(&args.parcel)?;
    let lock = ParcelLock::acquire(&args.parcel.join("lockfile"))?;

    let mut keyring = setup::open_keyring(&args.parcel)?;
    let mut local = setup::open_local_cache(&args.parcel, &parcel)?;

    let mut dirty = local.is_dirty();
    let required = parcel.required_compress();
    let mut damaged = keyring.validate(parcel.num_chunks, parcel.crypto, &required).is_err() || local.is_damaged();

    if args.full && !damaged {
        let previous = match &args.previous {
            Some(dir) => Some(setup::open_keyring(dir)?),
            None => None,
        };
        let mut buf = vec![0u8; parcel.chunk_size as usize];
        for (index, entry) in keyring.iter_ordered()? {
            let n = local.read(index, &mut buf)?;
            let ok = pk_codec::decode(&buf[..n as usize], Some(&entry.tag), &entry.key, entry.compression, n as usize, parcel.crypto).is_ok();
            if !ok {
                damaged = true;
                if args.splice {
                    if let Some(previous) = &previous {
                        if let Some(prev_entry) = previous.get(index)? {
                            keyring.transaction(|txn| pk_keyring::Keyring::put(txn, index, &prev_entry))?;
                        }
                    }
                }
            }
        }
    }

    if damaged {
        local.set_flag(LOCAL_CACHE_FLAG_DAMAGED, &lock)?;
        local.clear_flag(LOCAL_CACHE_FLAG_DIRTY, &lock)?;
        dirty = false;
    } else if args.full {
        local.clear_flag(LOCAL_CACHE_FLAG_DAMAGED, &lock)?;
    }

    let mut code = 0i32;
    if dirty {
        code |= 1;
    }
    if damaged {
        code |= 2;
    }
    Ok(code)
}

fn cmd_checkhoard(args: CheckhoardArgs) -> anyhow::Result<i32> {
    let mut hoard = open_bare_hoard(&args.hoard, args.chunk_size)?;
    let problems = hoard.checkhoard(args.full)?;
    for p in &problems {
        println!("{p}");
    }
    if args.compact {
        let reclaimed = hoard.compact()?;
        log::info!("checkhoard: compacted, reclaimed {reclaimed} byte(s)");
    }
    Ok(if problems.is_empty() { 0 } else { 1 })
}

fn cmd_refresh(args: RefreshArgs) -> anyhow::Result<i32> {
    let parcel = setup::load_parcel(&args.parcel)?;
    let keyring = setup::open_keyring(&args.parcel)?;

    let Some(hoard_dir) = &args.hoard else {
        log::info!("refresh: no hoard configured, nothing to do");
        return Ok(0);
    };
    let hoard = setup::open_hoard(hoard_dir, &parcel)?;
    let uuid = parcel.uuid.to_string();
    let id = hoard.register_parcel(&uuid, &parcel.server, &parcel.user, &parcel.name)?;
    let tags: Vec<Vec<u8>> = keyring.iter_ordered()?.into_iter().map(|(_, e)| e.tag).collect();
    hoard.sync_refs(id, false, &tags)?;
    log::info!("refresh: synced {} ref(s) for parcel {uuid}", tags.len());

    if args.gc {
        let freed = hoard.gc()?;
        log::info!("refresh: gc freed {freed} chunk slot(s)");
    }
    Ok(0)
}

fn cmd_disktool(args: DisktoolArgs) -> anyhow::Result<i32> {
    if args.import.is_some() == args.export.is_some() {
        anyhow::bail!("disktool: specify exactly one of --in or --out");
    }
    Parcel::verify_chunk_size(args.chunk_size)?;
    let compression: Compression = args.compression.parse()?;
    let allowed = [compression, Compression::None];
    let suite = CryptoSuite::AesSha1;

    let keyring_path = args.directory.join(&args.keyring);
    let mut kr = if keyring_path.exists() {
        Keyring::open(&keyring_path, Interrupt::new())?
    } else {
        Keyring::create(&keyring_path, Interrupt::new())?
    };

    if let Some(image_path) = &args.import {
        let data = fs::read(image_path)?;
        let mut count = 0u64;
        for (index, plain) in data.chunks(args.chunk_size as usize).enumerate() {
            let mut padded = vec![0u8; args.chunk_size as usize];
            padded[..plain.len()].copy_from_slice(plain);
            let encoded = pk_codec::encode(&padded, &allowed, suite)?;
            fetch::put_blob(&args.directory, index as u64, args.chunksperdir, &encoded.blob)?;
            kr.transaction(|txn| {
                pk_keyring::Keyring::put(
                    txn,
                    index as u64,
                    &pk_keyring::KeyEntry {
                        tag: encoded.tag.clone(),
                        key: encoded.key.clone(),
                        compression: encoded.compression,
                        length: encoded.blob.len() as u32,
                    },
                )
            })?;
            count += 1;
        }
        log::info!("disktool: imported {count} chunk(s) from {}", image_path.display());
    } else if let Some(out_path) = &args.export {
        use std::io::Write;
        let entries = kr.iter_ordered()?;
        let mut out = fs::File::create(out_path)?;
        for (index, entry) in &entries {
            let dir = index / args.chunksperdir as u64;
            let idx = index % args.chunksperdir as u64;
            let blob_path = args.directory.join(format!("{dir:04}")).join(format!("{idx:04}"));
            let blob = fs::read(&blob_path)?;
            let plain = pk_codec::decode(&blob, Some(&entry.tag), &entry.key, entry.compression, args.chunk_size as usize, suite)?;
            out.write_all(&plain)?;
        }
        log::info!("disktool: exported {} chunk(s) to {}", entries.len(), out_path.display());
    }

    Ok(0)
}

//! Compile-time paths and protocol/policy constants shared across the
//! parcelkeeper crates.
//!
//! This mirrors the role of a build-config crate in a larger daemon: small,
//! dependency-free, and included by everything else so that path and tuning
//! constants live in one place instead of being repeated as string literals.

pub const PARCELKEEPER_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const PARCELKEEPER_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");

#[macro_export]
macro_rules! PARCELKEEPER_RUN_DIR_M {
    () => {
        "/run/parcelkeeper"
    };
}

#[macro_export]
macro_rules! PARCELKEEPER_STATE_DIR_M {
    () => {
        "/var/lib/parcelkeeper"
    };
}

#[macro_export]
macro_rules! PARCELKEEPER_LOG_DIR_M {
    () => {
        "/var/log/parcelkeeper"
    };
}

#[macro_export]
macro_rules! PARCELKEEPER_CACHE_DIR_M {
    () => {
        "/var/cache/parcelkeeper"
    };
}

/// namespaced directory for in-memory (tmpfs) run state: pidfiles, mount markers
pub const PARCELKEEPER_RUN_DIR: &str = PARCELKEEPER_RUN_DIR_M!();

/// namespaced directory for persistent per-parcel local cache state
pub const PARCELKEEPER_STATE_DIR: &str = PARCELKEEPER_STATE_DIR_M!();

/// namespaced directory for daemon logging
pub const PARCELKEEPER_LOG_DIR: &str = PARCELKEEPER_LOG_DIR_M!();

/// default location of the shared hoard cache, when one is configured
pub const DEFAULT_HOARD_DIR: &str = concat!(PARCELKEEPER_CACHE_DIR_M!(), "/hoard");

/// Prepend the state directory to a file name.
#[macro_export]
macro_rules! statedir {
    ($subdir:expr) => {
        concat!($crate::PARCELKEEPER_STATE_DIR_M!(), $subdir)
    };
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!($crate::PARCELKEEPER_RUN_DIR_M!(), $subdir)
    };
}

// ---- canonical parcel geometry (spec §3 Parcel) -----------------------

/// Canonical chunk size: 128 KiB. Must be a power of two, >= 512.
pub const CANONICAL_CHUNK_SIZE: u32 = 128 * 1024;

/// Sector size used for hoard/local-cache offset alignment.
pub const SECTOR_SIZE: u64 = 512;

/// Byte offset at which the local cache data area begins (one 4 KiB page of header).
pub const LOCAL_CACHE_DATA_START: u64 = 4096;

/// Hoard allocator refill batch size (spec §4.4 slot allocator).
pub const HOARD_REFILL_BATCH: usize = 256;

// ---- writeback cache policy (spec §4.6) --------------------------------

/// Maximum age a dirty chunk may reach before the cleaner must flush it.
pub const DIRTY_WRITEBACK_DELAY_SECS: u64 = 5;

/// `allocatable` RAM quota is capped at this fraction of physical memory;
/// exceeding it at configuration time is a config error.
pub const MAX_CACHE_MULT: u64 = 1;
pub const MAX_CACHE_DIV: u64 = 10;

// ---- transport retry policy (spec §5) ----------------------------------

pub const TRANSPORT_TRIES: u32 = 5;
pub const TRANSPORT_RETRY_DELAY_SECS: u64 = 5;

/// Upper bound, in milliseconds, of the uniform random backoff used before
/// retrying a busy keyring/hoard transaction.
pub const DB_BUSY_BACKOFF_MAX_MS: u64 = 10;

// ---- on-disk magic numbers (spec §6.3, §6.5, §6.6) ---------------------

pub const LOCAL_CACHE_MAGIC: u32 = 0x5152_8038;
pub const LOCAL_CACHE_VERSION: u8 = 1;

pub const KEYRING_SCHEMA_VERSION: i64 = 1;
pub const HOARD_SCHEMA_VERSION: i64 = 9;

/// Fixed bits in the local cache header flags word (spec §6.3).
pub const LOCAL_CACHE_FLAG_DIRTY: u32 = 1;
pub const LOCAL_CACHE_FLAG_DAMAGED: u32 = 2;

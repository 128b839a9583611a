//! Advisory lock over a parcel directory's sentinel `lockfile` (the
//! original daemon's `WANT_LOCK`): held for the life of one command
//! invocation. Unlike `pk_hoard_cache::lock::HoardLock` (a blocking,
//! repeatedly-acquired byte-range lock reused across one process's whole
//! lifetime) this is non-blocking, whole-file, and never explicitly
//! unlocked — closing the fd on `Drop` releases it.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use pk_local_cache::ParcelLockProof;
use pk_types::error::{ErrorKind, PkError};

pub struct ParcelLock {
    _file: File,
}

impl ParcelLock {
    /// Fails with `Busy` if another process already holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, PkError> {
        let file = OpenOptions::new().write(true).create(true).open(path)?;

        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = 0;
        fl.l_len = 0; // whole file
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            let kind = match err.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EAGAIN) => ErrorKind::Busy,
                _ => ErrorKind::IoErr,
            };
            return Err(PkError::with_source(kind, "couldn't acquire parcel lock", err.into()));
        }
        Ok(Self { _file: file })
    }
}

impl ParcelLockProof for ParcelLock {
    fn holds_parcel_lock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_drop_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockfile");
        {
            let _lock = ParcelLock::acquire(&path).unwrap();
        }
        assert!(ParcelLock::acquire(&path).is_ok());
    }
}

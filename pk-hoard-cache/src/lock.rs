//! File-range lock over the hoard's backing file (spec §4.4): a read lock
//! held during normal operation, briefly upgraded to a write lock for
//! cleanup/compaction. Implemented with `fcntl(F_SETLKW)` byte-range locks
//! over a single sentinel byte at offset 0, since the whole hoard is
//! always locked as one unit in this design — a single-byte range is
//! just how POSIX spells "the whole file" without pulling in `flock(2)`'s
//! weaker whole-process semantics.

use std::os::unix::io::RawFd;

use pk_types::error::{ErrorKind, PkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

pub struct HoardLock {
    fd: RawFd,
}

impl HoardLock {
    pub fn acquire(fd: RawFd, kind: LockKind) -> Result<Self, PkError> {
        lock_range(fd, kind)?;
        Ok(Self { fd })
    }
}

impl Drop for HoardLock {
    fn drop(&mut self) {
        let _ = unlock_range(self.fd);
    }
}

fn lock_range(fd: RawFd, kind: LockKind) -> Result<(), PkError> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match kind {
        LockKind::Read => libc::F_RDLCK as i16,
        LockKind::Write => libc::F_WRLCK as i16,
    };
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = 0;
    fl.l_len = 1;
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
    if rc != 0 {
        return Err(PkError::with_source(
            ErrorKind::IoErr,
            "fcntl lock failed",
            std::io::Error::last_os_error().into(),
        ));
    }
    Ok(())
}

fn unlock_range(fd: RawFd) -> Result<(), PkError> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_UNLCK as i16;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = 0;
    fl.l_len = 1;
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if rc != 0 {
        return Err(PkError::with_source(
            ErrorKind::IoErr,
            "fcntl unlock failed",
            std::io::Error::last_os_error().into(),
        ));
    }
    Ok(())
}

//! Advisory locks between concurrent embervm invocations.
//!
//! A lock is an exclusive `flock` on a file under the state root. The file
//! stays in place and records the last owner's PID for error messages; the
//! kernel releases the lock when the holder's descriptor closes, so a
//! crashed owner never leaves a lock behind.

use super::StateStore;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Directory for lock files under the state root.
const LOCK_DIR: &str = ".locks";

/// A held advisory lock.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    // Closing the descriptor releases the flock.
    _file: File,
}

impl StateLock {
    /// Lock one VM name for `init`, `build` or `destroy`.
    pub fn vm(store: &StateStore, name: &str) -> Result<Self> {
        let path = store.root().join(LOCK_DIR).join(format!("vm-{}.lock", name));
        Self::acquire(&path, &format!("vm '{}'", name))
    }

    /// Lock the address allocator.
    pub fn allocator(store: &StateStore) -> Result<Self> {
        let path = store.root().join(LOCK_DIR).join("allocator.lock");
        Self::acquire(&path, "the address allocator")
    }

    fn acquire(path: &Path, resource: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !try_lock_exclusive(&file)? {
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            return Err(Error::Locked {
                resource: resource.to_string(),
                pid: owner.trim().parse().unwrap_or(0),
            });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        tracing::trace!(lock = %path.display(), "acquired lock");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `flock(LOCK_EX | LOCK_NB)`. `false` when another descriptor holds it.
fn try_lock_exclusive(file: &File) -> Result<bool> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EWOULDBLOCK)
    {
        return Ok(false);
    }
    Err(err.into())
}

//! Reader/writer exclusion between unrelated processes, using nothing but a directory.
//!
//! Each locked directory reserves a `readers` subdirectory:
//! - present and empty: unlocked;
//! - present with marker files: read-locked, one marker per reader;
//! - absent: write-locked.
//!
//! Every transition is a single atomic filesystem operation (create a file inside
//! `readers`, remove `readers` only if empty, create `readers`), so two processes
//! racing on the same directory always observe a consistent state.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::Serialize;
use tracing::debug;
use crate::error::{IoContext, PoolError, Result};
use crate::hold::HoldQuery;

pub const READERS_DIR: &str = "readers";
const MARKER_PREFIX: &str = "lock";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "state", content = "readers", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    ReadLocked(usize),
    WriteLocked,
}

/// One outstanding reader claim. Consumed by [`LockedDirectory::unlock`].
#[derive(Debug)]
pub struct ReadToken {
    file: File,
    path: PathBuf,
}

impl ReadToken {
    pub fn marker(&self) -> &Path {
        &self.path
    }
}

#[derive(Clone)]
pub struct LockedDirectory {
    readers: PathBuf,
    hold: Arc<dyn HoldQuery>,
}

impl std::fmt::Debug for LockedDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedDirectory").field("readers", &self.readers).finish()
    }
}

impl LockedDirectory {
    pub fn new<P: AsRef<Path>>(dir: P, hold: Arc<dyn HoldQuery>) -> Self {
        Self {
            readers: dir.as_ref().join(READERS_DIR),
            hold,
        }
    }

    pub fn readers_dir(&self) -> &Path {
        &self.readers
    }

    /// Registers a reader, unless a writer holds the directory.
    ///
    /// The marker stays open for as long as the token lives and is inherited by any
    /// program the caller spawns or execs, so occupancy outlives the acquiring call.
    pub fn try_read_lock(&self) -> Result<Option<ReadToken>> {
        let named = match tempfile::Builder::new()
            .prefix(MARKER_PREFIX)
            .tempfile_in(&self.readers)
        {
            Ok(named) => named,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PoolError::io(&self.readers, e)),
        };
        let (file, path) = named
            .keep()
            .map_err(|e| PoolError::io(&self.readers, e.error))?;
        set_inheritable(&file).at(&path)?;
        Ok(Some(ReadToken { file, path }))
    }

    /// Releases a reader claim by deleting its marker.
    ///
    /// # Errors
    /// [`PoolError::LockState`] if the marker is already gone.
    pub fn unlock(&self, token: ReadToken) -> Result<()> {
        let ReadToken { file, path } = token;
        // An open file can't be removed on Windows, while on Unix closing first would
        // let a concurrent sweep take the marker in between.
        #[cfg(windows)]
        drop(file);
        let removed = std::fs::remove_file(&path);
        #[cfg(not(windows))]
        drop(file);
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PoolError::LockState { path }),
            Err(e) => Err(PoolError::io(path, e)),
        }
    }

    /// Takes the directory exclusively if it has no live readers.
    pub fn try_write_lock(&self) -> Result<bool> {
        self.sweep()?;
        match std::fs::remove_dir(&self.readers) {
            Ok(()) => Ok(true),
            Err(e) if is_contention(&e) => Ok(false),
            Err(e) => Err(PoolError::io(&self.readers, e)),
        }
    }

    /// Gives the directory back, making it available to readers and writers.
    ///
    /// # Errors
    /// [`PoolError::LockState`] if the directory was not write-locked.
    pub fn write_unlock(&self) -> Result<()> {
        match std::fs::create_dir(&self.readers) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(PoolError::LockState {
                path: self.readers.clone(),
            }),
            Err(e) => Err(PoolError::io(&self.readers, e)),
        }
    }

    /// Current state as seen on disk. Stale markers count as readers until swept.
    pub fn state(&self) -> Result<LockState> {
        match std::fs::read_dir(&self.readers) {
            Ok(entries) => {
                let count = entries.filter(|e| e.is_ok()).count();
                Ok(match count {
                    0 => LockState::Unlocked,
                    n => LockState::ReadLocked(n),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockState::WriteLocked),
            Err(e) => Err(PoolError::io(&self.readers, e)),
        }
    }

    /// Deletes markers left behind by readers that died without unlocking.
    /// Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.readers) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PoolError::io(&self.readers, e)),
        };
        let mut markers: Vec<PathBuf> = entries
            .collect::<io::Result<Vec<_>>>()
            .at(&self.readers)?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        markers.sort();

        let mut swept = 0;
        for marker in markers {
            if self.hold.is_held(&marker).at(&marker)? {
                continue;
            }
            if idempotent_unlink(&marker)? {
                debug!("Swept: {}", marker.display());
                swept += 1;
            }
        }
        Ok(swept)
    }
}

fn idempotent_unlink(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PoolError::io(path, e)),
    }
}

/// `readers` already gone (another writer) or still populated (live readers).
fn is_contention(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty) {
        return true;
    }
    #[cfg(unix)]
    {
        // Some systems report a non-empty directory as EEXIST.
        if e.raw_os_error() == Some(libc::EEXIST) || e.raw_os_error() == Some(libc::ENOTEMPTY) {
            return true;
        }
    }
    false
}

/// Clears close-on-exec so children keep the marker open.
#[cfg(unix)]
fn set_inheritable(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `file` for the duration of both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_inheritable(_file: &File) -> io::Result<()> {
    Ok(())
}

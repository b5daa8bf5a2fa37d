use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use nix::fcntl::{flock, FlockArg};
use tracing::{debug, warn};

/// An exclusive advisory lock on a lock file, held until dropped.
///
/// Guards on-disk resources shared between processes (git mirrors). The
/// lock file is left in place after release.
#[derive(Debug)]
pub struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    /// Waits until the lock on `path` can be taken, without blocking the
    /// async runtime.
    pub async fn lock(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        tokio::task::spawn_blocking(move || {
            let file = open(&path)?;
            if flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
                debug!(path = %path.display(), "waiting for lock");
                flock(file.as_raw_fd(), FlockArg::LockExclusive)?;
            }
            Ok(Self { file, path })
        })
        .await?
    }

    /// Takes the lock if it's free, returns None otherwise.
    pub fn try_lock(path: impl Into<PathBuf>) -> io::Result<Option<Self>> {
        let path = path.into();
        let file = open(&path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(nix::errno::Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), err = %e, "failed to release lock");
        }
    }
}

//! Single-instance lock for the runner daemon
//!
//! Two runners on one host would race for the same address slots, TAP
//! devices and pool snapshots. The daemon takes an exclusive `flock` on
//! `<work_dir>/runner.lock` at startup and holds it until exit; the kernel
//! drops the lock if the process dies.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another runner already holds {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("flock on {path} failed: {errno}")]
    Flock { path: PathBuf, errno: Errno },
}

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without blocking
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => return Err(LockError::AlreadyRunning(path)),
            Err(errno) => return Err(LockError::Flock { path, errno }),
        }

        // Record the holder for operators; the lock itself is the flock
        file.set_len(0).ok();
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");

        let held = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning(_)));

        drop(held);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}

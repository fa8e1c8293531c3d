//! Singleton-instance PID file
//!
//! The file holds a single line, `<pid>\n`, and an exclusive advisory lock for
//! as long as the daemon runs. A second instance fails to take the lock and
//! refuses to start. The file is removed when the guard is dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::getpid;

use crate::relay::error::{RelayError, RelayResult};

/// Locked PID file, released and removed on drop
pub struct PidFile {
    path: PathBuf,
    _lock: Flock<File>,
}

impl PidFile {
    /// Create (or reuse) `path`, lock it and write this process's id
    ///
    /// # Errors
    ///
    /// `PidFile` if the file cannot be opened or written, or if another
    /// process holds the lock.
    pub fn acquire(path: &Path) -> RelayResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|e| RelayError::PidFile(format!("{}: {}", path.display(), e)))?;

        let mut lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            RelayError::PidFile(format!(
                "{} is locked by another instance: {}",
                path.display(),
                errno
            ))
        })?;

        // Only truncate once the lock is ours
        write_pid(&mut lock)
            .map_err(|e| RelayError::PidFile(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", getpid())?;
    file.sync_all()
}

impl std::fmt::Debug for PidFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFile").field("path", &self.path).finish()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Removed while still locked; the lock is released with the descriptor
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

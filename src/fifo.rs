//! Stdout/stderr FIFO handling.
//!
//! The orchestrator creates named pipes for task output and hands the
//! driver their paths. The driver opens both ends non-blocking so the pipe
//! stays writable for the daemon regardless of reader timing, and holds
//! the descriptors for the task's lifetime.

use crate::error::{Error, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;

/// Opens a FIFO with `O_RDWR | O_NONBLOCK`, mode 0600.
pub fn open_fifo(path: &Path) -> Result<OwnedFd> {
    let raw_fd = nix::fcntl::open(
        path,
        OFlag::O_RDWR | OFlag::O_NONBLOCK,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(|errno| Error::FifoOpen {
        path: path.display().to_string(),
        reason: errno.to_string(),
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw_fd) })
}

/// The stdout/stderr descriptor pair held for a task's lifetime. Dropping
/// the pair closes both pipes.
#[derive(Debug)]
pub struct TaskStdio {
    _stdout: OwnedFd,
    _stderr: OwnedFd,
}

impl TaskStdio {
    /// Opens both FIFOs for a task.
    pub fn open(stdout_path: &Path, stderr_path: &Path) -> Result<Self> {
        let stdout = open_fifo(stdout_path)?;
        let stderr = open_fifo(stderr_path)?;
        Ok(Self {
            _stdout: stdout,
            _stderr: stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fifo_missing_path_errors() {
        let err = open_fifo(Path::new("/nonexistent/fifo")).unwrap_err();
        assert!(matches!(err, Error::FifoOpen { .. }));
    }

    #[test]
    fn open_fifo_pair() {
        let dir = tempfile::TempDir::new().unwrap();
        let stdout = dir.path().join("task.stdout");
        let stderr = dir.path().join("task.stderr");
        nix::unistd::mkfifo(&stdout, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        nix::unistd::mkfifo(&stderr, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let stdio = TaskStdio::open(&stdout, &stderr);
        assert!(stdio.is_ok());
    }
}

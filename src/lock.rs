//! Per-application deploy lock
//!
//! An advisory `flock` on the app's `.deploy.lock` file. The lock is held for
//! as long as the [`AppLock`] value lives and is released when the file
//! descriptor is closed, including when the process dies.

use crate::config::LockMode;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("a deploy of '{app}' is already in progress")]
    Contention { app: String },

    #[error("failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock on one application's working tree
#[derive(Debug)]
pub struct AppLock {
    path: PathBuf,
    _file: File,
}

impl AppLock {
    /// Acquire the lock, waiting or failing fast according to `mode`.
    ///
    /// Blocking waits run on the blocking thread pool.
    pub async fn acquire(app: &str, path: &Path, mode: LockMode) -> Result<Self, LockError> {
        match mode {
            LockMode::Reject => Self::try_acquire(app, path),
            LockMode::Block => {
                let app = app.to_string();
                let path = path.to_path_buf();
                let io_path = path.clone();
                tokio::task::spawn_blocking(move || Self::acquire_blocking(&app, &path))
                    .await
                    .map_err(|e| LockError::Io {
                        path: io_path,
                        source: std::io::Error::new(std::io::ErrorKind::Other, e),
                    })?
            }
        }
    }

    /// Take the lock or fail with [`LockError::Contention`]
    pub fn try_acquire(app: &str, path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        match flock(&file, false) {
            Ok(()) => {
                debug!(app = %app, path = %path.display(), "Deploy lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    _file: file,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(LockError::Contention {
                app: app.to_string(),
            }),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Wait for the lock
    pub fn acquire_blocking(app: &str, path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        if flock(&file, false).is_err() {
            info!(app = %app, "Another deploy is in progress, waiting for it to finish");
            flock(&file, true).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        debug!(app = %app, path = %path.display(), "Deploy lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)
}

#[cfg(unix)]
fn flock(file: &File, wait: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let op = if wait {
        libc::LOCK_EX
    } else {
        libc::LOCK_EX | libc::LOCK_NB
    };

    loop {
        let result = unsafe { libc::flock(fd, op) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _wait: bool) -> std::io::Result<()> {
    Ok(())
}

// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bounded exclusive advisory locks on a sidecar lock file.
//!
//! The server config is replaced by rename on every write, so the lock lives
//! on a separate, never-renamed `<config>.lock` file.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {}s waiting for lock on {}", waited.as_secs_f32(), path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("failed to open lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Held for the whole read-modify-write span; dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release lock");
        } else {
            debug!(path = %self.path.display(), "released lock");
        }
    }
}

pub fn lock_path_for(config: &Path) -> PathBuf {
    let mut name = config.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    config.with_file_name(name)
}

pub async fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard, LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(io_err)?;

    let started = Instant::now();
    loop {
        match file.try_lock() {
            Ok(()) => {
                debug!(path = %path.display(), waited_ms = started.elapsed().as_millis() as u64, "acquired lock");
                return Ok(LockGuard {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Err(TryLockError::WouldBlock) => {
                if started.elapsed() >= timeout {
                    warn!(path = %path.display(), "lock acquisition timed out");
                    return Err(LockError::Timeout {
                        path: path.to_path_buf(),
                        waited: started.elapsed(),
                    });
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(TryLockError::Error(e)) => return Err(io_err(e)),
        }
    }
}

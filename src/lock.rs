// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cross-process state lock.
//!
//! Every session runs in its own process, so the only way for sessions to
//! agree on anything is through the file system. All reads and writes of the
//! shared session state happen while holding an exclusive advisory lock on a
//! lock file in the state directory.
//!
//! # Lock Lifetime
//!
//! The lock is an `flock(2)` lock held through an open file descriptor. The
//! kernel drops it the moment the holder's descriptor is closed, which
//! includes the holder crashing or being killed. A dead session can never
//! leave the lock behind. A _live_ session that holds the lock forever still
//! blocks everybody else, because acquisition has no timeout unless one is
//! configured.

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument, warn};

// Emit a warning once a session has been stuck waiting this long.
const SLOW_WAIT: Duration = Duration::from_secs(5);

/// Exclusive lock over the shared session state.
#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
    retry: Duration,
    timeout: Option<Duration>,
}

impl StateLock {
    /// Construct new state lock at target lock file path.
    ///
    /// Attempts are spaced by `retry`. Acquisition waits forever when
    /// `timeout` is [`None`].
    pub fn new(path: impl Into<PathBuf>, retry: Duration, timeout: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            retry,
            timeout,
        }
    }

    /// Path to lock file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Acquire the lock, spinning with a fixed backoff until it is free.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Open`] if lock file cannot be opened.
    /// - Return [`LockError::Flock`] if locking fails for reasons other than
    ///   contention.
    /// - Return [`LockError::TimedOut`] if a timeout is configured and the
    ///   lock stayed busy for that long.
    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    pub fn acquire(&self) -> Result<LockGuard> {
        let start = Instant::now();
        let mut warned = false;
        let mut file = self.open()?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!("state lock acquired after {:?}", start.elapsed());
                    return Ok(LockGuard { _lock: lock });
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => file = returned,
                Err((_, errno)) => {
                    return Err(LockError::Flock {
                        source: errno,
                        path: self.path.clone(),
                    })
                }
            }

            let waited = start.elapsed();
            if let Some(timeout) = self.timeout {
                if waited >= timeout {
                    return Err(LockError::TimedOut {
                        path: self.path.clone(),
                        waited,
                    });
                }
            }

            if !warned && waited >= SLOW_WAIT {
                warn!(
                    "still waiting for state lock at {:?}, another session is holding it",
                    self.path.display()
                );
                warned = true;
            }

            thread::sleep(self.retry);
        }
    }

    /// Attempt to acquire the lock exactly once.
    ///
    /// Returns [`None`] if some other holder has it.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Open`] if lock file cannot be opened.
    /// - Return [`LockError::Flock`] if locking fails for reasons other than
    ///   contention.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        match Flock::lock(self.open()?, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(LockGuard { _lock: lock })),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(LockError::Flock {
                source: errno,
                path: self.path.clone(),
            }),
        }
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| LockError::Open {
                source: err,
                path: self.path.clone(),
            })
    }
}

/// Proof of holding the state lock.
///
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct LockGuard {
    _lock: Flock<File>,
}

/// State lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock file cannot be opened or created.
    #[error("failed to open lock file at {:?}", path.display())]
    Open {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Lock system call failed.
    #[error("failed to lock {:?}", path.display())]
    Flock {
        #[source]
        source: Errno,
        path: PathBuf,
    },

    /// Lock stayed busy past the configured timeout.
    #[error("timed out after {waited:?} waiting for lock at {:?}", path.display())]
    TimedOut { path: PathBuf, waited: Duration },
}

/// Friendly result alias :3
pub type Result<T, E = LockError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shared session state.
//!
//! Concurrent sessions agree on how many of them are active, and on which
//! sidecars somebody is responsible for stopping, through a single small
//! record in the __state directory__.
//!
//! # State Directory Layout
//!
//! - `lock`: lock file, see [`StateLock`](crate::lock::StateLock).
//! - `state.toml`: the [`SessionState`] record.
//! - `model-server.log`: default log file for model server output.
//!
//! The record only exists while at least one session is active. When the
//! session count drops back to zero the record is deleted, so an absent record
//! and a zero count mean the same thing.

use crate::lock::LockGuard;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{self, read_to_string},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

const STATE_FILE: &str = "state.toml";
const LOCK_FILE: &str = "lock";
const MODEL_SERVER_LOG: &str = "model-server.log";

/// Who is responsible for stopping a sidecar.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Management {
    /// Nobody. Sessions leave this sidecar alone.
    #[default]
    Unmanaged,

    /// A session launched it. The process identifier is recorded when the
    /// launched process is the sidecar itself.
    Started { pid: Option<u32> },

    /// A session found it already running and took responsibility for it.
    Adopted,
}

impl Management {
    // INVARIANT: A recorded pid is always a positive `pid_t`. Anything else
    // would address a process group, or every process, once signalled.
    fn sanitized(self) -> Self {
        match self {
            Self::Started { pid: Some(pid) } if pid == 0 || i32::try_from(pid).is_err() => {
                warn!("discarding impossible recorded pid {pid}");
                Self::Started { pid: None }
            }
            other => other,
        }
    }
}

impl Display for Management {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Unmanaged => fmt.write_str("unmanaged"),
            Self::Started { pid: Some(pid) } => write!(fmt, "started (pid {pid})"),
            Self::Started { pid: None } => fmt.write_str("started"),
            Self::Adopted => fmt.write_str("adopted"),
        }
    }
}

/// Record shared between all sessions.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SessionState {
    /// Number of active sessions.
    pub sessions: u32,

    /// Management of the model server sidecar.
    #[serde(default)]
    pub model_server: Management,

    /// Management of the watcher sidecar.
    #[serde(default)]
    pub watcher: Management,
}

impl SessionState {
    fn sanitized(self) -> Self {
        Self {
            model_server: self.model_server.sanitized(),
            watcher: self.watcher.sanitized(),
            ..self
        }
    }
}

/// Handle to the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open state directory at target path.
    ///
    /// Creates the directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::CreateDir`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();

        // INVARIANT: State directory always exists after opening.
        mkdirp::mkdirp(&dir).map_err(|err| StoreError::CreateDir {
            source: err,
            path: dir.clone(),
        })?;

        Ok(Self { dir })
    }

    /// Path to state directory.
    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    /// Path to lock file guarding the record.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Path to the state record.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Default path for model server output.
    pub fn model_server_log(&self) -> PathBuf {
        self.dir.join(MODEL_SERVER_LOG)
    }

    /// Load the state record.
    ///
    /// Returns [`None`] if no record exists.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if the record cannot be read.
    /// - Return [`StoreError::Deserialize`] if the record is corrupt.
    pub fn load(&self, _guard: &LockGuard) -> Result<Option<SessionState>> {
        self.read()
    }

    /// Load the state record without holding the lock.
    ///
    /// The result is a snapshot for display only, it may already be stale by
    /// the time the caller looks at it.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if the record cannot be read.
    /// - Return [`StoreError::Deserialize`] if the record is corrupt.
    pub fn peek(&self) -> Result<Option<SessionState>> {
        self.read()
    }

    /// Replace the state record atomically.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Write`] if the record cannot be written.
    /// - Return [`StoreError::Serialize`] if the record cannot be serialized.
    #[instrument(skip(self, _guard), level = "debug")]
    pub fn save(&self, _guard: &LockGuard, state: &SessionState) -> Result<()> {
        let path = self.state_path();
        let contents = toml::ser::to_string(state)?;
        let write_err = |err| StoreError::Write {
            source: err,
            path: path.clone(),
        };

        // INVARIANT: Readers never observe a partially written record.
        let mut file = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        file.write_all(contents.as_bytes()).map_err(write_err)?;
        file.persist(&path).map_err(|err| write_err(err.error))?;
        debug!("saved session state to {:?}", path.display());

        Ok(())
    }

    /// Delete the state record.
    ///
    /// Deleting a record that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Remove`] if the record cannot be deleted.
    pub fn clear(&self, _guard: &LockGuard) -> Result<()> {
        let path = self.state_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("removed session state at {:?}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Remove { source: err, path }),
        }
    }

    fn read(&self) -> Result<Option<SessionState>> {
        let path = self.state_path();
        let data = match read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Read { source: err, path }),
        };

        toml::de::from_str::<SessionState>(&data)
            .map(|state| Some(state.sanitized()))
            .map_err(|err| StoreError::Deserialize { source: err, path })
    }
}

/// All possible error types for state store interaction.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// State directory cannot be created.
    #[error("failed to create state directory at {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// State record cannot be read.
    #[error("failed to read session state at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// State record cannot be written.
    #[error("failed to write session state at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// State record cannot be deleted.
    #[error("failed to remove session state at {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// State record is corrupt.
    #[error("corrupt session state at {:?}", path.display())]
    Deserialize {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    /// State record cannot be serialized.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

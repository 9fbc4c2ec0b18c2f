// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that sidekick reads to learn
//! which tool it wraps, and how each sidecar process is started, detected, and
//! stopped. Every field has a default, so a missing file or a partial file is
//! perfectly valid.

use serde::{Deserialize, Serialize};
use std::{
    env,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Environment variable that suppresses model server management.
pub const NO_MODEL_SERVER_ENV: &str = "SIDEKICK_NO_MODEL_SERVER";

/// Environment variable that suppresses watcher management.
pub const NO_WATCHER_ENV: &str = "SIDEKICK_NO_WATCHER";

/// Sidekick configuration layout.
///
/// # General Layout
///
/// The configuration is split into four tables: the wrapped tool, the state
/// lock, the model server sidecar, and the watcher sidecar.
///
/// ```toml
/// [tool]
/// program = "claude"
///
/// [lock]
/// retry_ms = 50
///
/// [model_server]
/// command = ["ollama", "serve"]
/// pattern = "ollama serve"
/// adopt_policy = "own"
///
/// [watcher]
/// marker = ".codeindex.toml"
/// start = ["codeindex", "watch", "--background"]
/// stop = ["codeindex", "watch", "--stop"]
/// pattern = "codeindex watch"
/// ```
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Tool that sessions wrap.
    pub tool: ToolSettings,

    /// State lock behavior.
    pub lock: LockSettings,

    /// Embedding model server sidecar.
    pub model_server: ModelServerSettings,

    /// File indexing watcher sidecar.
    pub watcher: WatcherSettings,
}

impl Config {
    /// Load configuration from target path.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if the file is not valid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match read_to_string(path.as_ref()) {
            Ok(data) => data.parse(),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(ConfigError::Read {
                source: error,
                path: path.as_ref().to_path_buf(),
            }),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.watcher.marker = expand_path(&config.watcher.marker)?;
        if let Some(log_file) = &config.model_server.log_file {
            config.model_server.log_file = Some(expand_path(log_file)?);
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Wrapped tool settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Program to execute for `sidekick run`.
    pub program: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: "claude".into(),
        }
    }
}

/// State lock settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockSettings {
    /// Fixed backoff between lock attempts in milliseconds.
    pub retry_ms: u64,

    /// Give up waiting for the lock after this many milliseconds.
    ///
    /// Wait forever when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl LockSettings {
    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retry_ms: 50,
            timeout_ms: None,
        }
    }
}

/// What to do with a sidecar that was already running when the first session
/// showed up.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdoptPolicy {
    /// Take ownership, and stop it when the last session ends.
    #[default]
    Own,

    /// Track it, but never stop it.
    NeverKill,
}

/// Embedding model server settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelServerSettings {
    /// Manage this sidecar at all.
    pub enabled: bool,

    /// Program and arguments that launch the server.
    pub command: Vec<String>,

    /// Substring of a command line that identifies a running server.
    pub pattern: String,

    /// Log file for server output, defaults to `model-server.log` in the
    /// state directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Time given to a fresh server to start listening.
    pub startup_delay_ms: u64,

    /// Time given to a server to exit after SIGTERM before SIGKILL.
    pub stop_timeout_ms: u64,

    /// Treatment of a server that was already running.
    pub adopt_policy: AdoptPolicy,
}

impl ModelServerSettings {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ModelServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec!["ollama".into(), "serve".into()],
            pattern: "ollama serve".into(),
            log_file: None,
            startup_delay_ms: 2000,
            stop_timeout_ms: 5000,
            adopt_policy: AdoptPolicy::default(),
        }
    }
}

/// File indexing watcher settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Manage this sidecar at all.
    pub enabled: bool,

    /// Project-local file whose presence enables the watcher. Relative paths
    /// are resolved against the current working directory.
    pub marker: PathBuf,

    /// Program and arguments that start the watcher in background mode.
    pub start: Vec<String>,

    /// Program and arguments that ask the watcher to stop gracefully.
    pub stop: Vec<String>,

    /// Substring of a command line that identifies a running watcher.
    pub pattern: String,

    /// Treatment of a watcher that was already running.
    pub adopt_policy: AdoptPolicy,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            marker: PathBuf::from(".codeindex.toml"),
            start: vec!["codeindex".into(), "watch".into(), "--background".into()],
            stop: vec!["codeindex".into(), "watch".into(), "--stop".into()],
            pattern: "codeindex watch".into(),
            adopt_policy: AdoptPolicy::default(),
        }
    }
}

/// Per-invocation suppression of sidecar management.
///
/// A suppressed sidecar kind is neither started nor stopped.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
pub struct EnvOverrides {
    pub no_model_server: bool,
    pub no_watcher: bool,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    ///
    /// Any non-empty value counts as set.
    pub fn from_env() -> Self {
        Self {
            no_model_server: env_flag(NO_MODEL_SERVER_ENV),
            no_watcher: env_flag(NO_WATCHER_ENV),
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var_os(key).is_some_and(|value| !value.is_empty())
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file exists, but cannot be read.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

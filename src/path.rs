// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where sidekick keeps its configuration file, and where it keeps
//! the shared state that concurrent sessions coordinate through.

use std::{env, path::PathBuf};

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "SIDEKICK_CONFIG";

/// Environment variable overriding the state directory path.
pub const STATE_DIR_ENV: &str = "SIDEKICK_STATE_DIR";

/// Determine absolute path to configuration file.
///
/// Uses `$SIDEKICK_CONFIG` if set. Otherwise uses XDG Base Directory path
/// `$XDG_CONFIG_HOME/sidekick/config.toml`. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_file() -> Result<PathBuf> {
    if let Some(path) = env_path(CONFIG_ENV) {
        return Ok(path);
    }

    dirs::config_dir()
        .map(|path| path.join("sidekick").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine absolute path to state directory.
///
/// Uses `$SIDEKICK_STATE_DIR` if set. Otherwise uses XDG Base Directory path
/// `$XDG_STATE_HOME/sidekick`, falling back to `$XDG_DATA_HOME/sidekick` on
/// platforms without a state directory. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(path) = env_path(STATE_DIR_ENV) {
        return Ok(path);
    }

    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|path| path.join("sidekick"))
        .ok_or(NoWayHome)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operating system process control.
//!
//! Sidecars are plain OS processes. Everything sidekick needs to know or do
//! about them goes through [`ProcessControl`]: find processes by command line,
//! probe a process identifier, launch detached processes, and terminate them.

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use std::{
    ffi::OsStr,
    fs::OpenOptions,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Layer of indirection for process control.
pub trait ProcessControl {
    /// Find identifiers of running processes whose command line contains
    /// `pattern`.
    fn find(&self, pattern: &str) -> Result<Vec<u32>>;

    /// Check whether a process with target identifier exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Full command line of target process.
    fn cmdline(&self, pid: u32) -> Result<String>;

    /// Launch a process detached from the current terminal.
    ///
    /// Output goes to `log` when given, and is discarded otherwise.
    fn spawn_detached(&self, command: &[String], log: Option<&Path>) -> Result<u32>;

    /// Run a command to completion.
    fn run(&self, command: &[String]) -> Result<()>;

    /// Wait up to `timeout` for a process launched by us to exit, and collect
    /// its exit status.
    ///
    /// Returns `true` if the process is gone.
    fn reap(&self, pid: u32, timeout: Duration) -> bool;

    /// Send SIGTERM to target process, and wait up to `timeout` for it to
    /// exit before sending SIGKILL.
    fn terminate(&self, pid: u32, timeout: Duration) -> Result<()>;

    /// Terminate every process whose command line contains `pattern`.
    fn kill_matching(&self, pattern: &str, timeout: Duration) -> Result<()>;
}

/// Process control through the host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    #[instrument(skip(self), level = "debug")]
    fn find(&self, pattern: &str) -> Result<Vec<u32>> {
        let listing = syscall_non_interactive("ps", ["-A", "-o", "pid=", "-o", "command="])?;
        let own = std::process::id();

        Ok(parse_process_listing(&listing)
            .filter(|(pid, command)| *pid != own && command.contains(pattern))
            .map(|(pid, _)| pid)
            .collect())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };

        match kill(target, None) {
            Ok(()) => true,
            // INVARIANT: Permission denied still means somebody owns that pid.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn cmdline(&self, pid: u32) -> Result<String> {
        let pid_arg = pid.to_string();
        syscall_non_interactive("ps", ["-p", pid_arg.as_str(), "-o", "command="])
    }

    #[instrument(skip(self), level = "debug")]
    fn spawn_detached(&self, command: &[String], log: Option<&Path>) -> Result<u32> {
        let (program, args) = command.split_first().ok_or(ProcessError::EmptyCommand)?;
        let (stdout, stderr) = match log {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| ProcessError::OpenLog {
                        source: err,
                        path: path.to_path_buf(),
                    })?;
                let clone = file.try_clone().map_err(|err| ProcessError::OpenLog {
                    source: err,
                    path: path.to_path_buf(),
                })?;
                (Stdio::from(file), Stdio::from(clone))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        // INVARIANT: New process group, so terminal signals aimed at the
        // wrapped tool never reach the sidecar.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|err| ProcessError::Spawn {
                source: err,
                program: program.clone(),
            })?;

        Ok(child.id())
    }

    #[instrument(skip(self), level = "debug")]
    fn run(&self, command: &[String]) -> Result<()> {
        let (program, args) = command.split_first().ok_or(ProcessError::EmptyCommand)?;
        let output = syscall_non_interactive(program, args)?;
        if !output.is_empty() {
            debug!("{output}");
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn reap(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited(pid) {
                return true;
            }

            if Instant::now() >= deadline {
                debug!("process {pid} still running after {timeout:?}");
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn terminate(&self, pid: u32, timeout: Duration) -> Result<()> {
        let target = to_pid(pid)?;
        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(err) => return Err(ProcessError::Signal { source: err, pid }),
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_exited(pid) {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!("process {pid} ignored SIGTERM for {timeout:?}, sending SIGKILL");
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(ProcessError::Signal { source: err, pid }),
        }

        // INVARIANT: Reap our own children so they do not linger as zombies.
        let deadline = Instant::now() + timeout;
        while !self.has_exited(pid) && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }

        Ok(())
    }

    fn kill_matching(&self, pattern: &str, timeout: Duration) -> Result<()> {
        for pid in self.find(pattern)? {
            self.terminate(pid, timeout)?;
        }

        Ok(())
    }
}

impl SystemProcesses {
    fn has_exited(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return true;
        };

        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) => true,
            // INVARIANT: Not our child, so fall back to probing. A zombie is
            // dead, it just waits on another session to reap it.
            Err(_) => !self.is_alive(pid) || is_zombie(pid),
        }
    }
}

fn is_zombie(pid: u32) -> bool {
    let pid_arg = pid.to_string();
    syscall_non_interactive("ps", ["-p", pid_arg.as_str(), "-o", "stat="])
        .map(|stat| stat.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

// INVARIANT: Zero and negative values address process groups, or every
// process we may signal. Never let those through.
fn to_pid(pid: u32) -> Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(ProcessError::InvalidPid { pid }),
    }
}

/// Parse `ps -o pid= -o command=` output into identifier and command line
/// pairs, skipping lines that do not start with a number.
pub(crate) fn parse_process_listing(listing: &str) -> impl Iterator<Item = (u32, &str)> {
    listing.lines().filter_map(|line| {
        let line = line.trim_start();
        let (pid, command) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        pid.parse::<u32>().ok().map(|pid| (pid, command.trim()))
    })
}

fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| ProcessError::Spawn {
            source: err,
            program: cmd.as_ref().to_string_lossy().into_owned(),
        })?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        let message = match stderr.trim_end() {
            "" => output.status.to_string(),
            stderr => stderr.to_string(),
        };
        return Err(ProcessError::Failed {
            program: cmd.as_ref().to_string_lossy().into_owned(),
            message,
        });
    }

    // INVARIANT: Chomp trailing newlines.
    Ok(stdout.trim_end().to_string())
}

/// Process control error types.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Command to run has no program.
    #[error("cannot run an empty command")]
    EmptyCommand,

    /// Program cannot be spawned.
    #[error("failed to spawn {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Program ran, but reported failure.
    #[error("command {program:?} failed:\n{message}")]
    Failed { program: String, message: String },

    /// Log file for a detached process cannot be opened.
    #[error("failed to open log file at {:?}", path.display())]
    OpenLog {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Process identifier does not name a single process.
    #[error("{pid} is not a valid process identifier")]
    InvalidPid { pid: u32 },

    /// Signal cannot be delivered.
    #[error("failed to signal process {pid}")]
    Signal {
        #[source]
        source: Errno,
        pid: u32,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ProcessError> = std::result::Result<T, E>;

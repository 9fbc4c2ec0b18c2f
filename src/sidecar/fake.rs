// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-memory process table for exercising sidecar logic without touching
//! real processes.

use crate::sidecar::process::{ProcessControl, ProcessError, Result};

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

#[derive(Debug, Default)]
struct FakeTable {
    next_pid: u32,
    running: BTreeMap<u32, String>,
    logs: HashMap<u32, PathBuf>,
    spawned: Vec<String>,
    ran: Vec<String>,
    terminated: Vec<u32>,
    reaped: Vec<u32>,
    run_hooks: HashMap<String, String>,
    fail_spawns: bool,
    hide_cmdlines: bool,
    block_on_spawn: Option<PathBuf>,
}

/// Shared fake process table.
///
/// Clones share the same table, so a test can hand one clone to the code
/// under test and inspect the other.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeProcesses {
    table: Arc<Mutex<FakeTable>>,
}

impl FakeProcesses {
    fn table(&self) -> MutexGuard<'_, FakeTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pretend some process with `cmdline` is running.
    pub(crate) fn insert(&self, cmdline: &str) -> u32 {
        let mut table = self.table();
        table.next_pid += 1;
        let pid = 1000 + table.next_pid;
        table.running.insert(pid, cmdline.to_string());
        pid
    }

    /// Make every launch fail.
    pub(crate) fn fail_spawns(&self) {
        self.table().fail_spawns = true;
    }

    /// Make every command line unreadable, as if `ps` were unavailable.
    pub(crate) fn hide_cmdlines(&self) {
        self.table().hide_cmdlines = true;
    }

    /// Launching anything puts a directory at `path`, so nothing can be
    /// written there afterwards.
    pub(crate) fn block_on_spawn(&self, path: impl Into<PathBuf>) {
        self.table().block_on_spawn = Some(path.into());
    }

    /// Running `command` makes every process matching `pattern` exit.
    pub(crate) fn on_run(&self, command: &str, pattern: &str) {
        self.table()
            .run_hooks
            .insert(command.to_string(), pattern.to_string());
    }

    pub(crate) fn pids(&self, pattern: &str) -> Vec<u32> {
        matching(&self.table(), pattern)
    }

    pub(crate) fn log_of(&self, pid: u32) -> Option<PathBuf> {
        self.table().logs.get(&pid).cloned()
    }

    pub(crate) fn spawned(&self) -> Vec<String> {
        self.table().spawned.clone()
    }

    pub(crate) fn ran(&self) -> Vec<String> {
        self.table().ran.clone()
    }

    pub(crate) fn terminated(&self) -> Vec<u32> {
        self.table().terminated.clone()
    }

    pub(crate) fn reaped(&self) -> Vec<u32> {
        self.table().reaped.clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn find(&self, pattern: &str) -> Result<Vec<u32>> {
        Ok(self.pids(pattern))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.table().running.contains_key(&pid)
    }

    fn cmdline(&self, pid: u32) -> Result<String> {
        let table = self.table();
        if table.hide_cmdlines {
            return Err(ProcessError::Failed {
                program: "ps".into(),
                message: "ps unavailable".into(),
            });
        }

        table
            .running
            .get(&pid)
            .cloned()
            .ok_or_else(|| ProcessError::Failed {
                program: "ps".into(),
                message: format!("no process {pid}"),
            })
    }

    fn spawn_detached(&self, command: &[String], log: Option<&Path>) -> Result<u32> {
        if command.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let cmdline = command.join(" ");
        if self.table().fail_spawns {
            return Err(ProcessError::Spawn {
                source: std::io::Error::other("spawn disabled"),
                program: command[0].clone(),
            });
        }

        let pid = self.insert(&cmdline);
        let mut table = self.table();
        if let Some(path) = &table.block_on_spawn {
            std::fs::create_dir_all(path.join("blocked")).map_err(|err| ProcessError::Spawn {
                source: err,
                program: command[0].clone(),
            })?;
        }
        table.spawned.push(cmdline);
        if let Some(log) = log {
            table.logs.insert(pid, log.to_path_buf());
        }

        Ok(pid)
    }

    fn run(&self, command: &[String]) -> Result<()> {
        let cmdline = command.join(" ");
        let mut table = self.table();
        if let Some(pattern) = table.run_hooks.get(&cmdline).cloned() {
            for pid in matching(&table, &pattern) {
                table.running.remove(&pid);
            }
        }
        table.ran.push(cmdline);

        Ok(())
    }

    fn reap(&self, pid: u32, _timeout: Duration) -> bool {
        let mut table = self.table();
        table.reaped.push(pid);
        !table.running.contains_key(&pid)
    }

    fn terminate(&self, pid: u32, _timeout: Duration) -> Result<()> {
        let mut table = self.table();
        if table.running.remove(&pid).is_some() {
            table.terminated.push(pid);
        }

        Ok(())
    }

    fn kill_matching(&self, pattern: &str, timeout: Duration) -> Result<()> {
        for pid in self.pids(pattern) {
            self.terminate(pid, timeout)?;
        }

        Ok(())
    }
}

fn matching(table: &FakeTable, pattern: &str) -> Vec<u32> {
    table
        .running
        .iter()
        .filter(|(_, cmdline)| cmdline.contains(pattern))
        .map(|(pid, _)| *pid)
        .collect()
}

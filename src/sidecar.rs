// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sidecar lifecycle.
//!
//! A __sidecar__ is an auxiliary background process that the wrapped tool
//! relies on, but that runs independently of it. Sidekick knows two kinds:
//!
//! 1. The __model server__, an embedding/model server that is launched
//!    detached with its output sent to a log file. Sidekick records the
//!    process identifier of a server it launches, so it can later stop that
//!    exact process.
//! 2. The __watcher__, a file indexing watcher that only makes sense inside a
//!    project carrying the watcher's marker file. The watcher puts itself into
//!    the background, so sidekick only knows it by command line pattern, and
//!    asks it to stop gracefully before resorting to force.
//!
//! # Lifecycle
//!
//! Each kind moves through `Unmanaged → Starting → Running(managed) →
//! Stopping → Unmanaged`. Provisioning happens only for the first session,
//! teardown only for the last one. Both record or consume a [`Management`]
//! value from the shared state record.
//!
//! # Adoption
//!
//! A sidecar that was already running when the first session showed up is
//! __adopted__: sidekick marks itself responsible for it even though it never
//! launched it. Whether an adopted sidecar is later stopped depends on its
//! [`AdoptPolicy`].
//!
//! Failures here are never fatal. Sidecars are best-effort infrastructure, so
//! every failure is logged and the session carries on.

pub mod process;

#[cfg(test)]
pub(crate) mod fake;

use crate::{
    config::{AdoptPolicy, ModelServerSettings, WatcherSettings},
    sidecar::process::ProcessControl,
    store::Management,
};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// How long the watcher's launcher gets to put the watcher in the background.
const LAUNCHER_GRACE: Duration = Duration::from_secs(2);

/// Embedding model server sidecar.
#[derive(Debug)]
pub struct ModelServer<'a, P>
where
    P: ProcessControl,
{
    settings: &'a ModelServerSettings,
    log_file: PathBuf,
    procs: &'a P,
}

impl<'a, P> ModelServer<'a, P>
where
    P: ProcessControl,
{
    /// Construct new model server handle.
    ///
    /// Server output goes to the configured log file, or `default_log` when
    /// none is configured.
    pub fn new(settings: &'a ModelServerSettings, default_log: PathBuf, procs: &'a P) -> Self {
        let log_file = settings.log_file.clone().unwrap_or(default_log);
        Self {
            settings,
            log_file,
            procs,
        }
    }

    /// Make sure a model server is running.
    ///
    /// Adopts a server that is already running. Otherwise launches a new one
    /// and records its process identifier. The server is always considered
    /// managed afterwards, even if the launch failed, so the last session
    /// still cleans up anything left matching the pattern.
    #[instrument(skip(self), level = "debug")]
    pub fn provision(&self) -> Management {
        if running(self.procs, &self.settings.pattern) {
            info!("adopting running model server {:?}", self.settings.pattern);
            return Management::Adopted;
        }

        match self
            .procs
            .spawn_detached(&self.settings.command, Some(&self.log_file))
        {
            Ok(pid) => {
                info!(
                    "started model server (pid {pid}), logging to {:?}",
                    self.log_file.display()
                );
                Management::Started { pid: Some(pid) }
            }
            Err(error) => {
                warn!("failed to start model server: {error}");
                Management::Started { pid: None }
            }
        }
    }

    /// Delay to give a freshly started server before the tool runs.
    pub fn startup_delay(&self, management: Management) -> Option<Duration> {
        match management {
            Management::Started { pid: Some(_) } => Some(self.settings.startup_delay()),
            _ => None,
        }
    }

    /// Stop a managed model server.
    ///
    /// Returns `true` if a stop was attempted.
    #[instrument(skip(self), level = "debug")]
    pub fn teardown(&self, management: Management) -> bool {
        let timeout = self.settings.stop_timeout();
        match management {
            Management::Unmanaged => false,
            Management::Adopted if self.settings.adopt_policy == AdoptPolicy::NeverKill => {
                info!("leaving adopted model server running");
                false
            }
            Management::Started { pid: Some(pid) } => {
                if !self.procs.is_alive(pid) {
                    debug!("model server (pid {pid}) already exited");
                    return false;
                }

                // INVARIANT: Only signal a recorded pid after confirming it
                // still runs the model server.
                match self.procs.cmdline(pid) {
                    Ok(cmdline) if cmdline.contains(&self.settings.pattern) => {}
                    Ok(_) => {
                        warn!("pid {pid} no longer belongs to the model server, not stopping it");
                        return false;
                    }
                    Err(error) => {
                        warn!("cannot inspect pid {pid}: {error}");
                        return self.stop_by_pattern(timeout);
                    }
                }

                info!("stopping model server (pid {pid})");
                if let Err(error) = self.procs.terminate(pid, timeout) {
                    warn!("failed to stop model server (pid {pid}): {error}");
                }
                true
            }
            Management::Started { pid: None } | Management::Adopted => {
                self.stop_by_pattern(timeout)
            }
        }
    }

    fn stop_by_pattern(&self, timeout: Duration) -> bool {
        if !running(self.procs, &self.settings.pattern) {
            return false;
        }

        warn!("stopping model server by pattern {:?}", self.settings.pattern);
        if let Err(error) = self.procs.kill_matching(&self.settings.pattern, timeout) {
            warn!("failed to stop model server: {error}");
        }
        true
    }
}

/// File indexing watcher sidecar.
#[derive(Debug)]
pub struct Watcher<'a, P>
where
    P: ProcessControl,
{
    settings: &'a WatcherSettings,
    marker: PathBuf,
    procs: &'a P,
}

impl<'a, P> Watcher<'a, P>
where
    P: ProcessControl,
{
    /// Construct new watcher handle for project at `workdir`.
    pub fn new(settings: &'a WatcherSettings, workdir: &Path, procs: &'a P) -> Self {
        Self {
            settings,
            marker: workdir.join(&settings.marker),
            procs,
        }
    }

    /// Project marker file is present.
    pub fn has_marker(&self) -> bool {
        self.marker.exists()
    }

    /// Make sure a watcher is running if the project asks for one.
    ///
    /// Management is decided by the marker file alone, regardless of who
    /// started a watcher that is already running.
    #[instrument(skip(self), level = "debug")]
    pub fn provision(&self) -> Management {
        if !self.has_marker() {
            debug!("no watcher marker at {:?}", self.marker.display());
            return Management::Unmanaged;
        }

        if running(self.procs, &self.settings.pattern) {
            info!("adopting running watcher {:?}", self.settings.pattern);
            return Management::Adopted;
        }

        match self.procs.spawn_detached(&self.settings.start, None) {
            Ok(pid) => {
                info!("started watcher (launcher pid {pid})");
                if !self.procs.reap(pid, LAUNCHER_GRACE) {
                    debug!("watcher launcher (pid {pid}) did not return, leaving it be");
                }
            }
            Err(error) => warn!("failed to start watcher: {error}"),
        }

        // INVARIANT: Watcher backgrounds itself, the launcher pid is useless.
        Management::Started { pid: None }
    }

    /// Stop a managed watcher.
    ///
    /// Asks for a graceful stop while the project still carries the marker,
    /// then forcibly terminates anything still matching the pattern.
    ///
    /// Returns `true` if a stop was attempted.
    #[instrument(skip(self), level = "debug")]
    pub fn teardown(&self, management: Management) -> bool {
        match management {
            Management::Unmanaged => return false,
            Management::Adopted if self.settings.adopt_policy == AdoptPolicy::NeverKill => {
                info!("leaving adopted watcher running");
                return false;
            }
            _ => {}
        }

        if self.has_marker() {
            info!("stopping watcher");
            if let Err(error) = self.procs.run(&self.settings.stop) {
                warn!("graceful watcher stop failed: {error}");
            }
        }

        if running(self.procs, &self.settings.pattern) {
            warn!(
                "watcher still running, stopping by pattern {:?}",
                self.settings.pattern
            );
            if let Err(error) = self
                .procs
                .kill_matching(&self.settings.pattern, Duration::from_secs(5))
            {
                warn!("failed to stop watcher: {error}");
            }
        }

        true
    }
}

fn running(procs: &impl ProcessControl, pattern: &str) -> bool {
    match procs.find(pattern) {
        Ok(pids) => !pids.is_empty(),
        Err(error) => {
            warn!("cannot list processes: {error}");
            false
        }
    }
}

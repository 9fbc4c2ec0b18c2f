// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Session-scoped sidecar management.
//!
//! A __session__ is one invocation of the wrapped tool, from its entry phase
//! through its exit phase. Sessions count themselves in the shared state
//! record, so sidecars are provisioned by whichever session moves the count
//! from zero to one, and torn down by whichever session moves it from one back
//! to zero.
//!
//! # Entry Phase
//!
//! Take the state lock, bump the session count, and if this is the first
//! session provision the sidecars and record who manages them. The lock is
//! released before the tool starts, so sessions only ever serialize on the
//! bookkeeping, never on each other's tool runtime.
//!
//! # Exit Phase
//!
//! Always runs after the tool, whatever its exit status. Take the state lock,
//! drop the session count, and if this was the last session delete the record
//! and tear down every managed sidecar before releasing the lock.
//!
//! # Caveats
//!
//! The count only tracks sessions that go through sidekick. Nothing stops a
//! tool that was started some other way from still using a sidecar that the
//! last wrapped session just stopped.

use crate::{
    config::{Config, EnvOverrides},
    lock::{LockError, LockGuard, StateLock},
    sidecar::{
        process::{ProcessControl, SystemProcesses},
        ModelServer, Watcher,
    },
    store::{Management, SessionState, StateStore, StoreError},
};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use std::{
    ffi::{OsStr, OsString},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command, ExitStatus},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

/// Exit status reported when the wrapped tool cannot be started at all.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Outcome of a session's entry phase.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Entry {
    /// Session count before this session joined.
    pub previous: u32,

    /// Model server management decided by this session.
    pub model_server: Management,

    /// Watcher management decided by this session.
    pub watcher: Management,

    /// Time to wait before starting the tool.
    pub startup_delay: Option<Duration>,
}

/// Outcome of a session's exit phase.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Exit {
    /// Session count after this session left.
    pub remaining: u32,

    /// Model server stop was attempted.
    pub stopped_model_server: bool,

    /// Watcher stop was attempted.
    pub stopped_watcher: bool,
}

/// Outcome of a manual reset.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Reset {
    /// Record that was discarded, if any.
    pub discarded: Option<SessionState>,

    /// Model server stop was attempted.
    pub stopped_model_server: bool,

    /// Watcher stop was attempted.
    pub stopped_watcher: bool,
}

/// Wrap tool invocations as reference holders on shared sidecars.
#[derive(Debug)]
pub struct SessionManager<P = SystemProcesses>
where
    P: ProcessControl,
{
    config: Config,
    overrides: EnvOverrides,
    store: StateStore,
    lock: StateLock,
    workdir: PathBuf,
    procs: P,
}

impl<P> SessionManager<P>
where
    P: ProcessControl,
{
    /// Construct new session manager.
    ///
    /// The watcher marker is looked up relative to `workdir`.
    pub fn new(
        config: Config,
        overrides: EnvOverrides,
        store: StateStore,
        workdir: impl Into<PathBuf>,
        procs: P,
    ) -> Self {
        let lock = StateLock::new(
            store.lock_path(),
            config.lock.retry(),
            config.lock.timeout(),
        );

        Self {
            config,
            overrides,
            store,
            lock,
            workdir: workdir.into(),
            procs,
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// State store shared by all sessions.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run the configured tool as one session.
    pub fn run(&self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> i32 {
        self.run_program(&self.config.tool.program, args)
    }

    /// Run `program` as one session.
    ///
    /// Arguments are forwarded untouched, and the exit status of `program`
    /// is returned untouched. A program killed by a signal reports
    /// `128 + signal`. Sidecar management never changes the result: its
    /// failures are logged and swallowed.
    #[instrument(skip(self, args), level = "debug")]
    pub fn run_program(
        &self,
        program: impl AsRef<OsStr> + std::fmt::Debug,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    ) -> i32 {
        let entry = match self.enter() {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!("running without sidecar management: {error}");
                None
            }
        };

        // INVARIANT: Once counted, this process must live to run its exit phase.
        let interrupted = entry.as_ref().map(|_| shield_signals());

        if let Some(delay) = entry.as_ref().and_then(|entry| entry.startup_delay) {
            debug!("waiting {delay:?} for model server to start listening");
            thread::sleep(delay);
        }

        let args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect::<Vec<OsString>>();
        let code = match Command::new(program.as_ref()).args(&args).status() {
            Ok(status) => exit_code(status),
            Err(error) => {
                error!("failed to run {program:?}: {error}");
                EXIT_SPAWN_FAILED
            }
        };

        if interrupted.is_some_and(|flag| flag.swap(false, Ordering::Relaxed)) {
            info!("interrupted while {program:?} ran, releasing session anyway");
        }

        if entry.is_some() {
            if let Err(error) = self.leave() {
                warn!("failed to release session: {error}");
            }
        }

        code
    }

    /// Entry phase: join as a session, provisioning sidecars if first.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Lock`] if the state lock cannot be acquired.
    /// - Return [`SessionError::Store`] if the state record cannot be read or
    ///   written. The session count is unchanged in that case, and any sidecar
    ///   this session launched is stopped again.
    #[instrument(skip(self), level = "debug")]
    pub fn enter(&self) -> Result<Entry> {
        let guard = self.lock.acquire()?;
        let mut state = self.store.load(&guard)?.unwrap_or_default();
        let previous = state.sessions;
        state.sessions = previous.saturating_add(1);

        let mut entry = Entry {
            previous,
            ..Default::default()
        };

        if previous == 0 {
            info!("first session, provisioning sidecars");
            state.model_server = Management::Unmanaged;
            state.watcher = Management::Unmanaged;

            if self.manages_model_server() {
                let server = self.model_server();
                state.model_server = server.provision();
                entry.startup_delay = server.startup_delay(state.model_server);
            }

            if self.manages_watcher() {
                state.watcher = self.watcher().provision();
            }

            entry.model_server = state.model_server;
            entry.watcher = state.watcher;
        }

        if let Err(error) = self.store.save(&guard, &state) {
            if previous == 0 {
                warn!("cannot record session, stopping sidecars it launched");
                let launched = SessionState {
                    sessions: 0,
                    model_server: launched_only(state.model_server),
                    watcher: launched_only(state.watcher),
                };
                self.teardown(&guard, &launched);
            }
            return Err(error.into());
        }
        debug!("session count {previous} -> {}", state.sessions);

        Ok(entry)
    }

    /// Exit phase: leave as a session, tearing down sidecars if last.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Lock`] if the state lock cannot be acquired.
    /// - Return [`SessionError::Store`] if the state record cannot be read,
    ///   written, or removed.
    #[instrument(skip(self), level = "debug")]
    pub fn leave(&self) -> Result<Exit> {
        let guard = self.lock.acquire()?;

        // INVARIANT: A missing record still counts this session.
        let mut state = self.store.load(&guard)?.unwrap_or(SessionState {
            sessions: 1,
            ..Default::default()
        });
        let previous = state.sessions;
        state.sessions = previous.saturating_sub(1);
        debug!("session count {previous} -> {}", state.sessions);

        if state.sessions > 0 {
            self.store.save(&guard, &state)?;
            return Ok(Exit {
                remaining: state.sessions,
                ..Default::default()
            });
        }

        info!("last session, tearing down sidecars");
        self.store.clear(&guard)?;
        let (stopped_model_server, stopped_watcher) = self.teardown(&guard, &state);

        Ok(Exit {
            remaining: 0,
            stopped_model_server,
            stopped_watcher,
        })
    }

    /// Discard the state record, and tear down whatever it says is managed.
    ///
    /// Meant for manual cleanup after a session died between its entry and
    /// exit phases, leaving a count that will never reach zero on its own.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Busy`] if some session holds the lock.
    /// - Return [`SessionError::ActiveSessions`] if the record counts active
    ///   sessions and `force` is not set.
    /// - Return [`SessionError::Lock`] or [`SessionError::Store`] on I/O
    ///   failure.
    #[instrument(skip(self), level = "debug")]
    pub fn reset(&self, force: bool) -> Result<Reset> {
        let guard = self.lock.try_acquire()?.ok_or_else(|| SessionError::Busy {
            path: self.lock.path().to_path_buf(),
        })?;

        let Some(state) = self.store.load(&guard)? else {
            return Ok(Reset::default());
        };

        if state.sessions > 0 && !force {
            return Err(SessionError::ActiveSessions {
                sessions: state.sessions,
            });
        }

        warn!("discarding session state {state:?}");
        self.store.clear(&guard)?;
        let (stopped_model_server, stopped_watcher) = self.teardown(&guard, &state);

        Ok(Reset {
            discarded: Some(state),
            stopped_model_server,
            stopped_watcher,
        })
    }

    /// Snapshot of the state record, for display.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::Store`] if the record cannot be read.
    pub fn status(&self) -> Result<SessionState> {
        Ok(self.store.peek()?.unwrap_or_default())
    }

    /// Model server pattern currently matches a running process.
    pub fn model_server_running(&self) -> bool {
        self.procs
            .find(&self.config.model_server.pattern)
            .is_ok_and(|pids| !pids.is_empty())
    }

    /// Watcher pattern currently matches a running process.
    pub fn watcher_running(&self) -> bool {
        self.procs
            .find(&self.config.watcher.pattern)
            .is_ok_and(|pids| !pids.is_empty())
    }

    // INVARIANT: Caller holds the lock for the whole teardown, so no new
    // session can adopt a sidecar that is in the middle of stopping.
    fn teardown(&self, _guard: &LockGuard, state: &SessionState) -> (bool, bool) {
        let stopped_watcher = self.manages_watcher() && self.watcher().teardown(state.watcher);
        let stopped_model_server =
            self.manages_model_server() && self.model_server().teardown(state.model_server);

        (stopped_model_server, stopped_watcher)
    }

    fn manages_model_server(&self) -> bool {
        self.config.model_server.enabled && !self.overrides.no_model_server
    }

    fn manages_watcher(&self) -> bool {
        self.config.watcher.enabled && !self.overrides.no_watcher
    }

    fn model_server(&self) -> ModelServer<'_, P> {
        ModelServer::new(
            &self.config.model_server,
            self.store.model_server_log(),
            &self.procs,
        )
    }

    fn watcher(&self) -> Watcher<'_, P> {
        Watcher::new(&self.config.watcher, &self.workdir, &self.procs)
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

// INVARIANT: Adopted sidecars were running before us, and stay that way.
fn launched_only(management: Management) -> Management {
    match management {
        Management::Adopted => Management::Unmanaged,
        other => other,
    }
}

/// Keep terminal signals from killing sidekick for the rest of its life.
///
/// The tool shares our process group, so it receives Ctrl-C and friends on
/// its own. Sidekick just has to survive them long enough to run its exit
/// phase. Handlers, unlike ignored dispositions, reset to default across
/// exec, so the tool still sees the signals normally.
///
/// Returns a flag raised whenever one of those signals arrived.
fn shield_signals() -> Arc<AtomicBool> {
    static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    Arc::clone(INTERRUPTED.get_or_init(|| {
        let flag = Arc::new(AtomicBool::new(false));
        for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT] {
            if let Err(error) = signal_hook::flag::register(signal, Arc::clone(&flag)) {
                debug!("cannot shield signal {signal}: {error}");
            }
        }
        flag
    }))
}

/// Session management error types.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// State lock cannot be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// State record cannot be accessed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Some session is holding the state lock right now.
    #[error("state lock at {:?} is held by a running session", path.display())]
    Busy { path: PathBuf },

    /// Record still counts active sessions.
    #[error("{sessions} session(s) still active, use --force to reset anyway")]
    ActiveSessions { sessions: u32 },
}

/// Friendly result alias :3
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

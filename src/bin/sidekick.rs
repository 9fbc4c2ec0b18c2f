// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use sidekick::{
    config::{Config, EnvOverrides},
    path::{default_config_file, default_state_dir},
    session::SessionManager,
    sidecar::process::SystemProcesses,
    store::StateStore,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, ffi::OsString, path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  sidekick [options] <sidekick-command>\n  sidekick [options] run [--] [args]...",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<i32> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_file()?,
        };
        let config = Config::load(&config_path)?;

        match self.command {
            Command::Run(opts) => run_tool(config, opts),
            Command::Exec(opts) => run_exec(config, opts),
            Command::Status(opts) => run_status(config, opts),
            Command::Reset(opts) => run_reset(config, opts),
            Command::Config(opts) => run_config(config, config_path, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the configured tool as a session.
    #[command(override_usage = "sidekick run [--] [args]...")]
    Run(RunOptions),

    /// Run an arbitrary program as a session.
    #[command(override_usage = "sidekick exec [--] <program> [args]...")]
    Exec(ExecOptions),

    /// Show shared session state.
    #[command(override_usage = "sidekick status [options]")]
    Status(StatusOptions),

    /// Discard leftover session state, and stop managed sidecars.
    #[command(override_usage = "sidekick reset [options]")]
    Reset(ResetOptions),

    /// Show effective configuration.
    #[command(override_usage = "sidekick config [options]")]
    Config(ConfigOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Arguments forwarded to the tool untouched.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "args")]
    pub args: Vec<OsString>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExecOptions {
    /// Program to run.
    #[arg(required = true, value_name = "program")]
    pub program: OsString,

    /// Arguments forwarded to the program untouched.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "args")]
    pub args: Vec<OsString>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Also check whether sidecar processes are running.
    #[arg(short, long)]
    pub processes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ResetOptions {
    /// Reset even though the state still counts active sessions.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigOptions {
    /// Print only the path to the configuration file.
    #[arg(short, long)]
    pub path: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_env("SIDEKICK_LOG")
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match run() {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

fn run() -> Result<i32> {
    Cli::parse().run()
}

fn session_manager(config: Config) -> Result<SessionManager> {
    let store = StateStore::open(default_state_dir()?)?;
    let workdir = env::current_dir().context("cannot determine current directory")?;

    Ok(SessionManager::new(
        config,
        EnvOverrides::from_env(),
        store,
        workdir,
        SystemProcesses,
    ))
}

fn run_tool(config: Config, opts: RunOptions) -> Result<i32> {
    let manager = session_manager(config)?;
    Ok(manager.run(opts.args))
}

fn run_exec(config: Config, opts: ExecOptions) -> Result<i32> {
    let manager = session_manager(config)?;
    Ok(manager.run_program(opts.program, opts.args))
}

fn run_status(config: Config, opts: StatusOptions) -> Result<i32> {
    let manager = session_manager(config)?;
    let state = manager.status()?;

    println!("state directory: {}", manager.store().dir().display());
    println!("sessions: {}", state.sessions);
    println!("model server: {}", state.model_server);
    println!("watcher: {}", state.watcher);

    if opts.processes {
        println!(
            "model server running: {}",
            yes_no(manager.model_server_running())
        );
        println!("watcher running: {}", yes_no(manager.watcher_running()));
    }

    Ok(0)
}

fn run_reset(config: Config, opts: ResetOptions) -> Result<i32> {
    let manager = session_manager(config)?;
    let reset = manager.reset(opts.force)?;

    match reset.discarded {
        Some(state) => println!("discarded state with {} session(s)", state.sessions),
        None => println!("nothing to reset"),
    }

    Ok(0)
}

fn run_config(config: Config, config_path: PathBuf, opts: ConfigOptions) -> Result<i32> {
    if opts.path {
        println!("{}", config_path.display());
    } else {
        print!("{config}");
    }

    Ok(0)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

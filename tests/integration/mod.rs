// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{path_str, stdout_of, SidekickFixture};

use anyhow::{anyhow, Result};
use indoc::{formatdoc, indoc};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use pretty_assertions::assert_eq;
use std::{
    thread,
    time::{Duration, Instant},
};

const NO_SIDECARS: &str = indoc! {r#"
    [tool]
    program = "sh"

    [model_server]
    enabled = false

    [watcher]
    enabled = false
"#};

fn sleeper_config(seconds: u32) -> String {
    formatdoc! {r#"
        [tool]
        program = "sh"

        [model_server]
        command = ["sleep", "{seconds}"]
        pattern = "sleep {seconds}"
        startup_delay_ms = 0
        stop_timeout_ms = 2000

        [watcher]
        enabled = false
    "#}
}

#[test]
fn run_forwards_arguments_and_exit_status() -> Result<()> {
    let fixture = SidekickFixture::new(NO_SIDECARS)?;

    let output = fixture.sidekick(&["run", "--", "-c", "echo \"$1\"; exit 5", "sh", "--not-ours"])?;
    assert_eq!(output.status.code(), Some(5));
    assert_eq!(stdout_of(&output), "--not-ours\n");
    assert!(!fixture.state_file().exists());

    Ok(())
}

#[test]
fn exec_reports_missing_program() -> Result<()> {
    let fixture = SidekickFixture::new(NO_SIDECARS)?;

    let output = fixture.sidekick(&["exec", "--", "sidekick-no-such-program"])?;
    assert_eq!(output.status.code(), Some(127));
    assert!(!fixture.state_file().exists());

    Ok(())
}

#[test]
fn model_server_lives_exactly_as_long_as_the_session() -> Result<()> {
    let fixture = SidekickFixture::new(sleeper_config(7311))?;
    let state_file = path_str(&fixture.state_file());

    let output = fixture.sidekick(&["exec", "--", "cat", state_file.as_str()])?;
    assert_eq!(output.status.code(), Some(0));

    let state = stdout_of(&output);
    assert!(state.contains("sessions = 1"), "unexpected state:\n{state}");
    assert!(state.contains("state = \"started\""), "unexpected state:\n{state}");
    let pid = state
        .lines()
        .find_map(|line| line.strip_prefix("pid = "))
        .ok_or_else(|| anyhow!("no pid recorded:\n{state}"))?
        .trim()
        .parse::<i32>()?;

    assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    assert!(!fixture.state_file().exists());
    assert!(fixture.state_dir().join("model-server.log").exists());

    Ok(())
}

#[test]
fn concurrent_sessions_leave_no_state_behind() -> Result<()> {
    let fixture = SidekickFixture::new(sleeper_config(7322))?;

    let children = (0..4)
        .map(|_| {
            fixture
                .command()
                .args(["exec", "--", "sh", "-c", "sleep 0.2"])
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()?;

    for mut child in children {
        assert_eq!(child.wait()?.code(), Some(0));
    }

    assert!(!fixture.state_file().exists());

    let output = fixture.sidekick(&["status", "--processes"])?;
    let status = stdout_of(&output);
    assert!(status.contains("sessions: 0"), "unexpected status:\n{status}");
    assert!(
        !status.contains("model server running: yes"),
        "unexpected status:\n{status}"
    );

    Ok(())
}

#[test]
fn interrupted_session_still_runs_exit_phase() -> Result<()> {
    let fixture = SidekickFixture::new(NO_SIDECARS)?;
    let mut child = fixture.command().args(["exec", "--", "sleep", "2"]).spawn()?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !fixture.state_file().exists() {
        if Instant::now() > deadline {
            child.kill()?;
            return Err(anyhow!("session never entered"));
        }
        thread::sleep(Duration::from_millis(20));
    }
    // Record is written just before the handlers go in.
    thread::sleep(Duration::from_millis(300));

    let wrapper = Pid::from_raw(i32::try_from(child.id())?);
    kill(wrapper, Signal::SIGTERM)?;
    kill(wrapper, Signal::SIGHUP)?;

    assert_eq!(child.wait()?.code(), Some(0));
    assert!(!fixture.state_file().exists());

    Ok(())
}

#[test]
fn status_reports_idle_state() -> Result<()> {
    let fixture = SidekickFixture::new(NO_SIDECARS)?;

    let output = fixture.sidekick(&["status"])?;
    assert_eq!(output.status.code(), Some(0));

    let status = stdout_of(&output);
    assert!(status.contains("sessions: 0"));
    assert!(status.contains("model server: unmanaged"));
    assert!(status.contains("watcher: unmanaged"));

    Ok(())
}

#[test]
fn reset_needs_force_for_leaked_sessions() -> Result<()> {
    let fixture = SidekickFixture::new(NO_SIDECARS)?;
    fixture.write_state("sessions = 2\n")?;

    let output = fixture.sidekick(&["reset"])?;
    assert_eq!(output.status.code(), Some(1));
    assert!(fixture.state_file().exists());

    let output = fixture.sidekick(&["reset", "--force"])?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_of(&output), "discarded state with 2 session(s)\n");
    assert!(!fixture.state_file().exists());

    Ok(())
}

#[test]
fn config_prints_effective_configuration() -> Result<()> {
    let fixture = SidekickFixture::new(NO_SIDECARS)?;

    let output = fixture.sidekick(&["config"])?;
    assert_eq!(output.status.code(), Some(0));

    let config: sidekick::config::Config = stdout_of(&output).parse()?;
    assert_eq!(config.tool.program, "sh");
    assert!(!config.model_server.enabled);
    assert!(!config.watcher.enabled);

    Ok(())
}

// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Child process handling for spawned scripts.
//!
//! A script talks the wire protocol on its stdin/stdout; channel scripts
//! additionally receive audio descriptors dup'ed to fds 3 and 4. Every
//! descriptor the engine creates is close-on-exec, so only the dup'ed
//! ones survive into the child. The child gets SIGINT/SIGQUIT ignored
//! (console noise) and SIGTERM/SIGHUP back at their defaults.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use anyhow::Context as _;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::stream::{pipe_halves, ReadHalf, WriteHalf};

/// Child-side audio descriptors: fd 3 is engine-to-child, fd 4 is
/// child-to-engine.
#[derive(Default)]
pub(crate) struct AudioChildFds {
    pub to_child: Option<OwnedFd>,
    pub from_child: Option<OwnedFd>,
}

pub(crate) struct SpawnedScript {
    pub child: Child,
    pub read: ReadHalf,
    pub write: WriteHalf,
}

/// Fork and exec `script` with `args` as its single argument, wired for
/// the line protocol. The audio fds are consumed either way.
pub(crate) fn spawn_script(
    script: &str,
    args: &str,
    audio: AudioChildFds,
) -> anyhow::Result<SpawnedScript> {
    let mut cmd = Command::new(script);
    if !args.is_empty() {
        cmd.arg(args);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let ain = audio.to_child.as_ref().map(|fd| fd.as_raw_fd());
    let aout = audio.from_child.as_ref().map(|fd| fd.as_raw_fd());
    // Runs between fork and exec: only async-signal-safe calls.
    unsafe {
        cmd.pre_exec(move || {
            reset_child_signals();
            set_audio_fd(ain, 3)?;
            set_audio_fd(aout, 4)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to execute script '{script}'"))?;
    drop(audio);

    let stdin = child
        .stdin
        .take()
        .context("child stdin not captured")?;
    let stdout = child
        .stdout
        .take()
        .context("child stdout not captured")?;
    let write_end = File::from(OwnedFd::from(stdin));
    let read_end = File::from(OwnedFd::from(stdout));
    let (read, write) = pipe_halves(read_end, write_end)?;
    debug!("launched external script '{script}' args='{args}' pid={}", child.id());
    Ok(SpawnedScript { child, read, write })
}

/// Launch a program detached from the engine: no protocol pipes, console
/// inherited. A reaper thread collects its exit status.
pub(crate) fn run_program(script: &str, args: &str, exec_printf: bool) -> bool {
    let mut cmd = Command::new(script);
    if !args.is_empty() {
        cmd.arg(args);
    }
    unsafe {
        cmd.pre_exec(|| {
            reset_child_signals();
            Ok(())
        });
    }
    match cmd.spawn() {
        Ok(mut child) => {
            debug_exec(true, script, args, "program", exec_printf);
            let pid = child.id();
            let reaper = std::thread::Builder::new()
                .name("ExtMod Reaper".into())
                .spawn(move || {
                    let _ = child.wait();
                });
            if reaper.is_err() {
                warn!("could not start reaper for pid {pid}");
            }
            info!("launched external program '{script}' args='{args}' pid={pid}");
            true
        }
        Err(e) => {
            debug_exec(false, script, args, "program", exec_printf);
            warn!("failed to execute program '{script}' args='{args}': {e}");
            false
        }
    }
}

/// Shield the child from console signals and restore termination
/// defaults. Runs between fork and exec.
fn reset_child_signals() {
    // SAFETY: signal(2) with the library dispositions is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGQUIT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGHUP, libc::SIG_DFL);
    }
}

/// Duplicate an inherited pipe end onto `target` in the child, or make
/// sure the slot is closed.
fn set_audio_fd(fd: Option<i32>, target: i32) -> std::io::Result<()> {
    // SAFETY: dup2/close on descriptors the parent kept open for the
    // duration of the spawn.
    unsafe {
        match fd {
            Some(fd) => {
                if libc::dup2(fd, target) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            None => {
                libc::close(target);
            }
        }
    }
    Ok(())
}

fn debug_exec(start: bool, script: &str, args: &str, what: &str, exec_printf: bool) {
    let text = if start {
        format!("Executing {what} '{script}' args='{args}'")
    } else {
        format!("Failed to execute {what} '{script}' args='{args}'")
    };
    if exec_printf {
        eprintln!("{text}");
    } else if start {
        info!("{text}");
    } else {
        warn!("{text}");
    }
}

/// Send SIGTERM to a spawned script.
pub(crate) fn terminate(child: &Child) {
    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
}

/// Non-blocking reap; true when the child is gone (exited or already
/// collected elsewhere).
pub(crate) fn try_reap(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("pid {} exited: {status}", child.id());
            true
        }
        Ok(None) => false,
        // ECHILD and friends: nothing left for us to collect.
        Err(_) => true,
    }
}

/// Create a close-on-exec pipe pair `(read, write)`.
pub(crate) fn cloexec_pipe() -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("pipe")?;
    Ok((r, w))
}

/// Turn an owned descriptor into a `File` without changing flags.
pub(crate) fn fd_file(fd: OwnedFd) -> File {
    File::from(fd)
}

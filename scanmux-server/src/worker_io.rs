//! Subprocess plumbing for one worker slot: activation, the
//! request/reply round trip, and the stderr / status-pipe drains.
//!
//! A worker is the configured filter program run with `-server` (or
//! `-serveru` when status reports are on). It reads one command line
//! on stdin, writes one reply line on stdout, and loops. Anything on
//! stderr goes to the log; with `-Z`, fd 3 carries the worker's
//! self-reported status tag, one line at a time.

use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;
use tracing::{info, warn};

use scanmux_core::Settings;
use scanmux_core::codec::read_line_bounded;
use scanmux_core::command::MAX_CMD_LEN;

use crate::supervisor::{Event, IoOutcome};

/// The descriptors the supervisor talks to a worker through. Dropping
/// this closes the worker's stdin, which a well-behaved worker treats
/// as "exit now".
#[derive(Debug)]
pub struct WorkerIo {
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

#[derive(Debug)]
pub struct Spawned {
    pub pid: i32,
    pub io: WorkerIo,
}

/// Fork and exec a worker for `slot`. Spawns the stderr drain, the
/// status drain (if enabled), and the wait task that reports the
/// eventual exit back to the supervisor.
pub fn spawn_worker(
    settings: &Settings,
    slot: usize,
    tx: &UnboundedSender<Event>,
) -> anyhow::Result<Spawned> {
    let mut cmd = Command::new(&settings.prog_path);
    if let Some(sub) = &settings.sub_filter {
        cmd.arg("-f").arg(sub);
    }
    cmd.arg(if settings.want_status_reports {
        "-serveru"
    } else {
        "-server"
    });
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let status_read = if settings.want_status_reports {
        let (read_end, write_end) = nix::unistd::pipe().context("status pipe failed")?;
        let raw_write = write_end.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                // The worker expects its status channel on fd 3.
                if nix::libc::dup2(raw_write, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        // write_end must stay open until after spawn(); it is dropped
        // at the end of this scope, leaving the child as the only
        // holder of the write side.
        Some((read_end, write_end))
    } else {
        None
    };

    let rss = settings.max_rss_kb;
    unsafe {
        cmd.pre_exec(move || {
            // Undo the Rust runtime's SIGPIPE ignore; workers expect
            // default dispositions.
            nix::libc::signal(nix::libc::SIGPIPE, nix::libc::SIG_DFL);
            if let Some(kb) = rss {
                let bytes = kb.saturating_mul(1024);
                let _ = nix::sys::resource::setrlimit(
                    nix::sys::resource::Resource::RLIMIT_RSS,
                    bytes,
                    bytes,
                );
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("could not exec {}", settings.prog_path.display()))?;
    let pid = child
        .id()
        .context("spawned worker has no pid")? as i32;

    let stdin = child.stdin.take().context("worker stdin missing")?;
    let stdout = child.stdout.take().context("worker stdout missing")?;
    let stderr = child.stderr.take().context("worker stderr missing")?;

    tokio::spawn(drain_stderr(slot, pid, stderr, tx.clone()));

    if let Some((read_end, write_end)) = status_read {
        drop(write_end);
        match tokio::net::unix::pipe::Receiver::from_owned_fd(read_end) {
            Ok(receiver) => {
                tokio::spawn(drain_status(slot, pid, receiver, tx.clone()));
            }
            Err(e) => warn!("worker {slot}: could not watch status pipe: {e}"),
        }
    }

    tokio::spawn(wait_for_exit(slot, pid, child, tx.clone()));

    Ok(Spawned {
        pid,
        io: WorkerIo {
            stdin,
            stdout: BufReader::new(stdout),
        },
    })
}

async fn wait_for_exit(slot: usize, pid: i32, mut child: Child, tx: UnboundedSender<Event>) {
    match child.wait().await {
        Ok(status) => {
            let _ = tx.send(Event::Reaped { slot, pid, status });
        }
        Err(e) => warn!("wait for worker {slot} (pid {pid}) failed: {e}"),
    }
}

async fn drain_stderr(
    slot: usize,
    pid: i32,
    stderr: tokio::process::ChildStderr,
    tx: UnboundedSender<Event>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if line.contains("Out of memory!") {
            let _ = tx.send(Event::WorkerOom { slot, pid });
        }
        info!("worker {slot} stderr: {line}");
    }
}

async fn drain_status(
    slot: usize,
    pid: i32,
    receiver: tokio::net::unix::pipe::Receiver,
    tx: UnboundedSender<Event>,
) {
    let mut lines = BufReader::new(receiver).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if tx
            .send(Event::WorkerStatusLine { slot, pid, line })
            .is_err()
        {
            break;
        }
    }
}

/// One request round trip: write the command line, then read the
/// single-line reply. The outcome always carries the descriptors back
/// so the supervisor can decide whether the worker survives. If the
/// supervisor aborts this task instead, the descriptors die with it
/// and the worker sees EOF.
pub async fn run_request(
    slot: usize,
    mut io: WorkerIo,
    line: Vec<u8>,
    write_timeout: Duration,
    read_timeout: Duration,
    tx: UnboundedSender<Event>,
) {
    let outcome = match timeout(write_timeout, io.stdin.write_all(&line)).await {
        Err(_) | Ok(Err(_)) => IoOutcome::WriteFailed(io),
        Ok(Ok(())) => match timeout(read_timeout, read_line_bounded(&mut io.stdout, MAX_CMD_LEN)).await
        {
            Err(_) => IoOutcome::ReadTimeout(io),
            Ok(Err(_)) => IoOutcome::ReadError(io),
            Ok(Ok(None)) => IoOutcome::Eof(io),
            Ok(Ok(Some(reply))) => IoOutcome::Reply(reply, io),
        },
    };
    let _ = tx.send(Event::RequestDone { slot, outcome });
}

//! # scanmux-server
//!
//! Supervisor daemon for a pool of long-lived filter worker
//! processes. Milter front-ends connect over local sockets and submit
//! one-line requests; the supervisor routes each request to a free
//! worker (starting one if needed), enforces per-worker lifetime and
//! load policy, keeps fine-grained load history, and exposes a text
//! control protocol for status, reports, and reloads.
//!
//! The process model is deliberately single-threaded: everything runs
//! on a current-thread tokio runtime, and all mutable state lives in
//! one supervisor task fed by an event channel (see `supervisor`).

mod cli;
mod daemon;
mod listener;
mod map;
mod notifier;
mod server;
mod sockets;
mod stats;
mod supervisor;
mod worker_io;

use anyhow::Context;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cli::Cli;
use crate::daemon::Handshake;

fn main() {
    match real_main() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("scanmux-server: {e:#}");
            std::process::exit(1);
        }
    }
}

fn real_main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if args.version {
        println!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (mut settings, opts) = args.into_parts();
    settings.sanitize();

    // Everything below forks; get privileges and the working directory
    // sorted out first.
    if let Some(user) = &opts.run_as_user {
        daemon::drop_privileges(user)?;
    }
    std::fs::create_dir_all(&settings.spool_dir).ok();
    std::env::set_current_dir(&settings.spool_dir).with_context(|| {
        format!("unable to chdir into spool directory {}", settings.spool_dir.display())
    })?;

    let mut handshake = if opts.no_daemon {
        Handshake::foreground()
    } else {
        daemon::daemonize()?
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanmux_server=info,scanmux_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if nix::unistd::Uid::effective().is_root() {
        warn!("running as root; use -U to run as an unprivileged user");
    }

    let pid_guard = match daemon::lock_and_write_pidfile(
        opts.pidfile.as_deref(),
        opts.lockfile.as_deref(),
    ) {
        Ok(g) => g,
        Err(e) => {
            let msg = format!("cannot lock lockfile: is another copy running? ({e})");
            handshake.report_error(&msg);
            anyhow::bail!(msg);
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not build runtime")?;
    let result = runtime.block_on(server::run(settings, opts, &mut handshake));

    drop(pid_guard);
    result
}

//! Wiring: bind the sockets, install the signal forwarders, start the
//! supervisor, and confirm startup to the waiting parent.

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::info;

use scanmux_core::Settings;

use crate::cli::ServerOptions;
use crate::daemon::Handshake;
use crate::supervisor::{Event, Supervisor};
use crate::{listener, map, notifier, sockets, stats::StatsLog};

pub async fn run(
    settings: Settings,
    opts: ServerOptions,
    handshake: &mut Handshake,
) -> anyhow::Result<()> {
    match setup_and_run(settings, opts, handshake).await {
        Ok(()) => Ok(()),
        Err(e) => {
            handshake.report_error(&format!("{e:#}"));
            Err(e)
        }
    }
}

async fn setup_and_run(
    settings: Settings,
    opts: ServerOptions,
    handshake: &mut Handshake,
) -> anyhow::Result<()> {
    let (tx, rx) = unbounded_channel();
    let backlog = settings.effective_backlog();
    let cmd_umask = sockets::command_socket_umask(settings.group_access);
    let mut cleanup_paths = Vec::new();

    let priv_listener = sockets::make_unix_listener(&settings.sock_path, backlog, cmd_umask)
        .context("unable to create listening socket")?;
    cleanup_paths.push(settings.sock_path.clone());
    listener::spawn_privileged(priv_listener, tx.clone(), settings.client_timeout);

    if let Some(path) = &settings.unpriv_sock_path {
        // Anyone may connect here; the verb table is what limits them.
        let l = sockets::make_unix_listener(path, backlog, 0o000)
            .context("unable to create unprivileged listening socket")?;
        cleanup_paths.push(path.clone());
        listener::spawn_unprivileged(l, tx.clone(), settings.client_timeout);
    }

    if let Some(path) = &settings.notify_sock_path {
        let l = sockets::make_unix_listener(path, backlog, cmd_umask)
            .context("unable to create notification socket")?;
        cleanup_paths.push(path.clone());
        notifier::spawn_accept(l, tx.clone());
    }

    if let Some(spec) = &settings.map_sock {
        let l = sockets::make_map_listener(spec, backlog, cmd_umask)
            .await
            .context("unable to create map socket")?;
        if spec.starts_with('/') {
            cleanup_paths.push(spec.into());
        }
        map::spawn_accept(l, tx.clone(), settings.client_timeout);
    }

    spawn_signal_forwarders(tx.clone())?;

    info!(
        "started; minWorkers={}, maxWorkers={}, maxRequests={}, maxLifetime={}, maxIdleTime={}, busyTimeout={}, clientTimeout={}",
        settings.min_workers,
        settings.max_workers,
        settings.max_requests,
        settings.max_lifetime.map_or(0, |v| v as i64),
        settings.max_idle_time,
        settings.busy_timeout,
        settings.client_timeout
    );

    let stats = StatsLog::new(opts.stats_file.clone(), opts.stats_to_log, opts.flush_stats);
    let mut supervisor = Supervisor::new(settings, stats, tx, cleanup_paths);
    supervisor.start();

    handshake.report_ok();
    supervisor.run(rx).await;
    info!("supervisor stopped");
    Ok(())
}

fn spawn_signal_forwarders(tx: UnboundedSender<Event>) -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate()).context("could not install SIGTERM handler")?;
    let mut intr = signal(SignalKind::interrupt()).context("could not install SIGINT handler")?;
    let mut hup = signal(SignalKind::hangup()).context("could not install SIGHUP handler")?;

    {
        let tx = tx.clone();
        tokio::spawn(async move {
            if term.recv().await.is_some() {
                let _ = tx.send(Event::Shutdown);
            }
        });
    }
    {
        // SIGINT forces a reread of the filter rules, same as the
        // "reread" verb.
        let tx = tx.clone();
        tokio::spawn(async move {
            while intr.recv().await.is_some() {
                if tx.send(Event::Reload).is_err() {
                    break;
                }
            }
        });
    }
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            if tx.send(Event::ReopenStats).is_err() {
                break;
            }
        }
    });
    Ok(())
}

//! Accept loops and per-connection handling for the command sockets.
//!
//! Each connection carries exactly one request: read a line, hand it
//! to the supervisor, write whatever comes back, close. The
//! unprivileged socket serves the same read-only verbs but is capped
//! to a fixed number of simultaneous connections so a stuck monitor
//! cannot starve the privileged path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use scanmux_core::codec::read_line_bounded;
use scanmux_core::command::MAX_CMD_LEN;

use crate::supervisor::Event;

/// Simultaneous connections allowed on the unprivileged socket.
const MAX_UNPRIV_CONNS: usize = 20;

pub fn spawn_privileged(listener: UnixListener, tx: UnboundedSender<Event>, client_timeout: u64) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let tx = tx.clone();
                    tokio::spawn(serve_connection(stream, true, tx, client_timeout, None));
                }
                Err(e) => {
                    warn!("accept on command socket failed: {e}");
                }
            }
        }
    });
}

pub fn spawn_unprivileged(listener: UnixListener, tx: UnboundedSender<Event>, client_timeout: u64) {
    let conns = Arc::new(AtomicUsize::new(0));
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if conns.load(Ordering::Relaxed) >= MAX_UNPRIV_CONNS {
                        drop(stream);
                        continue;
                    }
                    conns.fetch_add(1, Ordering::Relaxed);
                    let tx = tx.clone();
                    let counter = Arc::clone(&conns);
                    tokio::spawn(serve_connection(
                        stream,
                        false,
                        tx,
                        client_timeout,
                        Some(counter),
                    ));
                }
                Err(e) => {
                    warn!("accept on unprivileged socket failed: {e}");
                }
            }
        }
    });
}

async fn serve_connection(
    stream: tokio::net::UnixStream,
    privileged: bool,
    tx: UnboundedSender<Event>,
    client_timeout: u64,
    counter: Option<Arc<AtomicUsize>>,
) {
    let _guard = counter.map(ConnGuard);
    let wait = Duration::from_secs(client_timeout);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let line = match timeout(wait, read_line_bounded(&mut reader, MAX_CMD_LEN)).await {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("request read failed: {e}");
            return;
        }
        Err(_) => {
            debug!("timeout reading request");
            return;
        }
    };
    // Strip the newline, and a carriage return so telnet works on the
    // unprivileged socket.
    let mut line = String::from_utf8_lossy(&line).into_owned();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    if tx
        .send(Event::Control {
            line,
            privileged,
            reply: reply_tx,
        })
        .is_err()
    {
        return;
    }

    let Ok(reply) = reply_rx.await else {
        return;
    };
    if reply.is_empty() {
        return;
    }
    match timeout(wait, write_half.write_all(&reply)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("reply write failed: {e}"),
        Err(_) => debug!("timeout writing reply"),
    }
}

struct ConnGuard(Arc<AtomicUsize>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

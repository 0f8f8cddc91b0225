//! Notification-socket plumbing.
//!
//! The supervisor owns the listener registry (masks and per-listener
//! channels); this module owns the sockets. Each accepted subscriber
//! gets a reader task (subscription lines in) and a writer task
//! (events out). The writer applies the pending-buffer policy from
//! `scanmux_core::notify`: while a write is in flight, further events
//! accumulate up to a small cap, beyond which only the newest
//! survives. A slow consumer loses messages, never slows the pool.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::timeout;
use tracing::warn;

use scanmux_core::codec::read_line_bounded;
use scanmux_core::notify::{self, SubscriptionMask};

use crate::supervisor::Event;

/// Seconds a listener gets to consume one write.
const WRITE_TIMEOUT_SECS: u64 = 10;

/// Supervisor-side handle for one connected listener.
#[derive(Debug)]
pub struct ListenerHandle {
    pub mask: SubscriptionMask,
    pub tx: UnboundedSender<String>,
}

pub fn spawn_accept(listener: UnixListener, tx: UnboundedSender<Event>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if tx.send(Event::NotifyConn { stream }).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("accept on notify socket failed: {e}"),
            }
        }
    });
}

/// All listener slots taken: tell the client and hang up.
pub fn reject(stream: UnixStream) {
    tokio::spawn(async move {
        let mut stream = stream;
        let _ = timeout(
            Duration::from_secs(WRITE_TIMEOUT_SECS),
            stream.write_all(b"*ERR No free listening slots\n"),
        )
        .await;
    });
}

/// Wire up a newly accepted subscriber: banner, reader, writer.
pub fn attach(id: usize, stream: UnixStream, events: UnboundedSender<Event>) -> ListenerHandle {
    let (read_half, write_half) = stream.into_split();
    let (msg_tx, msg_rx) = unbounded_channel::<String>();
    tokio::spawn(writer(id, write_half, msg_rx, events.clone()));
    tokio::spawn(reader(id, read_half, events));
    let handle = ListenerHandle {
        mask: SubscriptionMask::NONE,
        tx: msg_tx,
    };
    // The banner does not start with a capital letter, so it passes
    // the (still empty) mask.
    let _ = handle.tx.send("*OK\n".to_string());
    handle
}

async fn writer(
    id: usize,
    mut write_half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<String>,
    events: UnboundedSender<Event>,
) {
    'outer: while let Some(msg) = rx.recv().await {
        let mut pending = msg;
        while !pending.is_empty() {
            let result = timeout(
                Duration::from_secs(WRITE_TIMEOUT_SECS),
                write_half.write_all(pending.as_bytes()),
            )
            .await;
            if !matches!(result, Ok(Ok(()))) {
                break 'outer;
            }
            // Collect whatever queued up while we were writing.
            pending.clear();
            while let Ok(next) = rx.try_recv() {
                notify::fold_pending(&mut pending, &next);
            }
        }
    }
    let _ = events.send(Event::ListenerGone { id });
}

async fn reader(id: usize, read_half: OwnedReadHalf, events: UnboundedSender<Event>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_line_bounded(&mut reader, notify::MAX_PENDING).await {
            Ok(Some(line)) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                // Only subscription requests are recognized; anything
                // else is ignored.
                if let Some(codes) = text.strip_prefix('?') {
                    let mask = SubscriptionMask::from_request(codes);
                    if events.send(Event::ListenerSub { id, mask }).is_err() {
                        return;
                    }
                }
            }
            _ => break,
        }
    }
    let _ = events.send(Event::ListenerGone { id });
}

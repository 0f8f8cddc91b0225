//! The map sub-protocol: length-prefixed netstrings over a dedicated
//! socket (unix or TCP).
//!
//! A client sends `"<len>:<map-name> <key>,"` and gets a netstring
//! back whose payload starts with `OK`, `NOTFOUND`, `TEMP`, or `PERM`
//! (the worker decides which). Connections are persistent: after each
//! reply the server goes back to reading the next request. Unlike the
//! command path, map requests are never queued; with no free worker
//! the client immediately gets a `TEMP` reply and may retry.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use scanmux_core::codec::{read_netstring, write_netstring};

use crate::sockets::MapListener;
use crate::supervisor::Event;

pub fn spawn_accept(listener: MapListener, tx: UnboundedSender<Event>, client_timeout: u64) {
    tokio::spawn(async move {
        match listener {
            MapListener::Unix(l) => loop {
                match l.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(stream, tx.clone(), client_timeout));
                    }
                    Err(e) => warn!("accept on map socket failed: {e}"),
                }
            },
            MapListener::Tcp(l) => loop {
                match l.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(stream, tx.clone(), client_timeout));
                    }
                    Err(e) => warn!("accept on map socket failed: {e}"),
                }
            },
        }
    });
}

async fn serve_connection<S>(stream: S, tx: UnboundedSender<Event>, client_timeout: u64)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let wait = Duration::from_secs(client_timeout);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        // Requests may be arbitrarily far apart; only the reply write
        // is deadline-bound.
        let request = match read_netstring(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                debug!("map request framing error: {e}");
                return;
            }
        };

        let reply = match parse_request(&request) {
            Ok((map, key)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx
                    .send(Event::MapRequest {
                        map,
                        key,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    return;
                }
                match reply_rx.await {
                    Ok(r) => r,
                    Err(_) => b"TEMP Multiplexor is shutting down".to_vec(),
                }
            }
            Err(msg) => msg.as_bytes().to_vec(),
        };

        match timeout(wait, write_netstring(&mut write_half, &reply)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("map reply write failed: {e}");
                return;
            }
            Err(_) => {
                debug!("timeout writing map reply");
                return;
            }
        }
    }
}

/// Split `"<map-name> <key>"`; both halves travel percent-encoded on
/// the worker's stdin, so they may contain anything here.
fn parse_request(payload: &[u8]) -> Result<(String, String), &'static str> {
    let text = String::from_utf8_lossy(payload);
    match text.split_once(' ') {
        Some((map, key)) if !map.is_empty() => Ok((map.to_string(), key.to_string())),
        _ => Err("PERM Invalid request format"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_must_contain_a_space() {
        assert!(parse_request(b"mailertable example.com").is_ok());
        assert!(parse_request(b"nospace").is_err());
        assert!(parse_request(b" keyonly").is_err());
    }

    #[test]
    fn key_may_contain_spaces() {
        let (map, key) = parse_request(b"access From:1.2.3.4 x").unwrap();
        assert_eq!(map, "access");
        assert_eq!(key, "From:1.2.3.4 x");
    }
}

//! Listening-socket construction.
//!
//! All local sockets are unlinked and re-bound at startup, created
//! with an explicit umask (owner-only by default, group-accessible
//! with `-G`, wide open for the unprivileged socket) and the
//! configured listen backlog. The map socket may instead be a TCP
//! `host:port`.

use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::Context;
use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket};
use nix::sys::stat::{Mode, umask};
use tokio::net::{TcpListener, UnixListener};

/// Umask for sockets the milter front-end connects to.
pub fn command_socket_umask(group_access: bool) -> u32 {
    if group_access { 0o007 } else { 0o077 }
}

/// Bind a unix listening socket with the given creation umask.
pub fn make_unix_listener(
    path: &Path,
    backlog: i32,
    socket_umask: u32,
) -> anyhow::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let old = umask(Mode::from_bits_truncate(socket_umask));
    let bound = bind_unix(path, backlog);
    umask(old);
    let listener = bound.with_context(|| format!("could not listen on {}", path.display()))?;
    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}

fn bind_unix(path: &Path, backlog: i32) -> anyhow::Result<std::os::unix::net::UnixListener> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(backlog)?)?;
    Ok(std::os::unix::net::UnixListener::from(fd))
}

/// Either flavor of map listener.
#[derive(Debug)]
pub enum MapListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// The map socket accepts a unix path (absolute) or a TCP
/// `host:port`.
pub async fn make_map_listener(
    spec: &str,
    backlog: i32,
    socket_umask: u32,
) -> anyhow::Result<MapListener> {
    if spec.starts_with('/') {
        Ok(MapListener::Unix(make_unix_listener(
            Path::new(spec),
            backlog,
            socket_umask,
        )?))
    } else {
        let listener = TcpListener::bind(spec)
            .await
            .with_context(|| format!("could not listen on {spec}"))?;
        Ok(MapListener::Tcp(listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_rebinds_a_unix_socket() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux.sock");

        let first = make_unix_listener(&path, 5, 0o077).unwrap();
        drop(first);
        // A stale socket file from a previous run must not break
        // binding.
        let _second = make_unix_listener(&path, 5, 0o077).unwrap();
        assert!(path.exists());
    }
}

//! Daemonization, the startup handshake, privilege dropping, and the
//! pidfile lock.
//!
//! The classic double fork runs before the async runtime exists. The
//! grandchild keeps the write end of a pipe; once its sockets are
//! bound it writes a single `X`, or `E` plus a message on a fatal
//! startup error. The original parent blocks on the read end and
//! turns that byte into its exit status, so `scanmux-server &&
//! echo ok` only prints once the daemon is actually serving.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::{ForkResult, Uid, User, fork, setsid};

/// Write end of the startup-handshake pipe, if daemonized.
#[derive(Debug)]
pub struct Handshake {
    pipe: Option<File>,
}

impl Handshake {
    pub fn foreground() -> Self {
        Self { pipe: None }
    }

    /// Tell the waiting parent that startup succeeded.
    pub fn report_ok(&mut self) {
        if let Some(mut f) = self.pipe.take() {
            let _ = f.write_all(b"X");
        }
    }

    /// Tell the waiting parent that startup failed.
    pub fn report_error(&mut self, msg: &str) {
        if let Some(mut f) = self.pipe.take() {
            let _ = f.write_all(format!("E{msg}").as_bytes());
        }
    }
}

/// Fork into the background. Returns only in the grandchild; the
/// intermediate child and the original parent exit here.
pub fn daemonize() -> anyhow::Result<Handshake> {
    let (read_fd, write_fd) = nix::unistd::pipe().context("pipe failed")?;
    let mut read_end = File::from(read_fd);
    let write_end = File::from(write_fd);

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => {
            drop(write_end);
            let mut buf = [0u8; 256];
            let n = read_end.read(&mut buf).unwrap_or(0);
            if n == 1 && buf[0] == b'X' {
                std::process::exit(0);
            }
            if n > 1 && buf[0] == b'E' {
                eprintln!(
                    "scanmux-server: {}",
                    String::from_utf8_lossy(&buf[1..n])
                );
                std::process::exit(1);
            }
            eprintln!("scanmux-server: daemon exited before reporting startup status");
            std::process::exit(1);
        }
        ForkResult::Child => {}
    }

    drop(read_end);
    setsid().context("setsid failed")?;
    unsafe {
        let _ = nix::sys::signal::signal(Signal::SIGHUP, SigHandler::SigIgn);
    }

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio_to_devnull();
    Ok(Handshake {
        pipe: Some(write_end),
    })
}

fn redirect_stdio_to_devnull() {
    use std::os::fd::AsRawFd;
    if let Ok(null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        for fd in 0..=2 {
            unsafe {
                let _ = nix::libc::dup2(null.as_raw_fd(), fd);
            }
        }
    }
}

/// Switch to an unprivileged user: set the group list, gid, and uid.
pub fn drop_privileges(username: &str) -> anyhow::Result<()> {
    let user = User::from_name(username)
        .context("user lookup failed")?
        .with_context(|| format!("unknown user '{username}'"))?;
    if !Uid::effective().is_root() {
        // Nothing to drop; just confirm we already are that user.
        if Uid::effective() == user.uid {
            return Ok(());
        }
        bail!("cannot switch to user '{username}' without root privileges");
    }
    nix::unistd::setgid(user.gid).context("setgid failed")?;
    let cname = std::ffi::CString::new(username).context("bad username")?;
    nix::unistd::initgroups(&cname, user.gid).context("initgroups failed")?;
    nix::unistd::setuid(user.uid).context("setuid failed")?;
    Ok(())
}

/// Holds the single-instance lock and removes pidfile and lockfile on
/// shutdown.
pub struct PidfileGuard {
    pidfile: Option<PathBuf>,
    lockfile: Option<PathBuf>,
    _lock: Option<Flock<File>>,
}

impl std::fmt::Debug for PidfileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidfileGuard")
            .field("pidfile", &self.pidfile)
            .field("lockfile", &self.lockfile)
            .finish_non_exhaustive()
    }
}

impl Drop for PidfileGuard {
    fn drop(&mut self) {
        if let Some(p) = &self.pidfile {
            let _ = std::fs::remove_file(p);
        }
        if let Some(p) = &self.lockfile {
            let _ = std::fs::remove_file(p);
        }
    }
}

/// Take the advisory lock and record our pid. With no pidfile and no
/// lockfile this is a no-op guard.
///
/// The lock file defaults to `<pidfile>.lock`. Failing to take the
/// lock means another instance is already running.
pub fn lock_and_write_pidfile(
    pidfile: Option<&Path>,
    lockfile: Option<&Path>,
) -> anyhow::Result<PidfileGuard> {
    let lock_path: Option<PathBuf> = match (pidfile, lockfile) {
        (_, Some(l)) => Some(l.to_path_buf()),
        (Some(p), None) => {
            let mut os = p.as_os_str().to_os_string();
            os.push(".lock");
            Some(PathBuf::from(os))
        }
        (None, None) => None,
    };

    let lock = match &lock_path {
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("could not open lock file {}", path.display()))?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(l) => Some(l),
                Err((_, e)) => bail!("lock on {} refused: {e}", path.display()),
            }
        }
        None => None,
    };

    if let Some(p) = pidfile {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(p)
            .with_context(|| format!("could not open PID file {}", p.display()))?;
        writeln!(f, "{}", std::process::id())?;
        // World-readable so tooling can find us.
        let _ = std::fs::set_permissions(p, std::os::unix::fs::PermissionsExt::from_mode(0o644));
    }

    Ok(PidfileGuard {
        pidfile: pidfile.map(Path::to_path_buf),
        lockfile: lock_path,
        _lock: lock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_attempt_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("mux.pid");

        let guard = lock_and_write_pidfile(Some(&pid_path), None).unwrap();
        assert!(pid_path.exists());
        let written = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        assert!(lock_and_write_pidfile(Some(&pid_path), None).is_err());

        drop(guard);
        assert!(!pid_path.exists());

        // After release a new instance can lock again.
        let _guard = lock_and_write_pidfile(Some(&pid_path), None).unwrap();
    }

    #[test]
    fn no_paths_is_a_no_op_guard() {
        let guard = lock_and_write_pidfile(None, None).unwrap();
        drop(guard);
    }
}

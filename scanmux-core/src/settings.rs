//! Runtime settings for the multiplexor.
//!
//! Values arrive from the command line and are normalized by
//! [`Settings::sanitize`], which applies the same silent clamping the
//! daemon has always done: obviously out-of-range values are pulled
//! back into range rather than rejected, so a sloppy init script still
//! produces a running (if conservatively configured) multiplexor.

use std::path::PathBuf;

use crate::queue::MAX_QUEUE_SIZE;

/// Default socket file name created under the spool directory when no
/// `-s` path is given.
pub const DEFAULT_SOCK_NAME: &str = "scanmux.sock";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Minimum number of workers kept running.
    pub min_workers: usize,
    /// Size of the worker slot array.
    pub max_workers: usize,
    /// Cap on concurrent recipok checks per destination domain (0 = off).
    pub max_recipok_per_domain: usize,
    /// Requests served before a worker is retired.
    pub max_requests: u32,
    /// Seconds a worker may live past its first request (None = unlimited).
    pub max_lifetime: Option<u64>,
    /// Idle seconds after which excess workers are killed; also the
    /// sweep interval.
    pub max_idle_time: u64,
    /// Seconds a busy worker gets to produce its reply.
    pub busy_timeout: u64,
    /// Timeout for client request reads and reply writes.
    pub client_timeout: u64,
    /// Seconds between activations when refilling to `min_workers`.
    pub slew_time: u64,
    /// Absolute minimum seconds between any two activations (0 = off).
    pub wait_time: u64,
    /// Deferred-request queue capacity (0 = queueing disabled).
    pub queue_size: usize,
    /// Seconds a deferred request may wait before its originator gets
    /// an error.
    pub queue_timeout: u64,
    /// listen(2) backlog; None means derive from `max_workers`.
    pub listen_backlog: Option<i32>,
    /// Spool directory the supervisor chdirs into.
    pub spool_dir: PathBuf,
    /// Privileged command socket path.
    pub sock_path: PathBuf,
    /// Unprivileged command socket path, if any.
    pub unpriv_sock_path: Option<PathBuf>,
    /// Notification socket path, if any.
    pub notify_sock_path: Option<PathBuf>,
    /// Map-request socket: unix path or `host:port`.
    pub map_sock: Option<String>,
    /// Absolute path of the filter worker program.
    pub prog_path: PathBuf,
    /// Optional sub-filter handed to the worker via `-f`.
    pub sub_filter: Option<String>,
    /// Seconds between tick dispatches (0 = off).
    pub tick_interval: u64,
    /// Number of concurrent tick loops.
    pub num_ticks: usize,
    /// Seconds between periodic status log lines (0 = off).
    pub log_status_interval: u64,
    /// Give workers a status descriptor (fd 3) and track their
    /// self-reported status tags.
    pub want_status_reports: bool,
    /// RSS limit for workers, in kB.
    pub max_rss_kb: Option<u64>,
    /// Create sockets group-accessible instead of owner-only.
    pub group_access: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 2,
            max_recipok_per_domain: 0,
            max_requests: 500,
            max_lifetime: None,
            max_idle_time: 300,
            busy_timeout: 120,
            client_timeout: 10,
            slew_time: 3,
            wait_time: 0,
            queue_size: 0,
            queue_timeout: 30,
            listen_backlog: None,
            spool_dir: PathBuf::from("/var/spool/scanmux"),
            sock_path: PathBuf::new(),
            unpriv_sock_path: None,
            notify_sock_path: None,
            map_sock: None,
            prog_path: PathBuf::from("/usr/bin/scanmux-filter"),
            sub_filter: None,
            tick_interval: 0,
            num_ticks: 1,
            log_status_interval: 0,
            want_status_reports: false,
            max_rss_kb: None,
            group_access: false,
        }
    }
}

impl Settings {
    /// Fix obvious stupidities, silently.
    pub fn sanitize(&mut self) {
        if self.max_workers < 1 {
            self.max_workers = 1;
        }
        if self.min_workers < 1 {
            self.min_workers = 1;
        }
        if self.min_workers > self.max_workers {
            self.min_workers = self.max_workers;
        }
        if self.max_recipok_per_domain >= self.max_workers {
            self.max_recipok_per_domain = 0;
        }
        if self.max_requests < 1 {
            self.max_requests = 1;
        }
        if self.max_idle_time < 10 {
            self.max_idle_time = 10;
        }
        if self.busy_timeout < 10 {
            self.busy_timeout = 10;
        }
        if self.client_timeout < 10 {
            self.client_timeout = 10;
        }
        if self.slew_time < 1 {
            self.slew_time = 1;
        }
        if self.queue_size > MAX_QUEUE_SIZE {
            self.queue_size = MAX_QUEUE_SIZE;
        }
        self.queue_timeout = self.queue_timeout.clamp(1, 600);
        if self.num_ticks < 1 {
            self.num_ticks = 1;
        } else if self.num_ticks > 30 {
            self.num_ticks = 30;
        }
        if self.log_status_interval > 0 && self.log_status_interval < 5 {
            self.log_status_interval = 5;
        }
        if self.sock_path.as_os_str().is_empty() {
            self.sock_path = self.spool_dir.join(DEFAULT_SOCK_NAME);
        }
    }

    /// listen(2) backlog: the configured value, or a quarter of the
    /// pool size clamped to [5, 200].
    pub fn effective_backlog(&self) -> i32 {
        match self.listen_backlog {
            Some(n) => n.clamp(5, 200),
            None => (self.max_workers as i32 / 4).clamp(5, 200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_min_to_max() {
        let mut s = Settings {
            min_workers: 10,
            max_workers: 4,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.min_workers, 4);
        assert_eq!(s.max_workers, 4);
    }

    #[test]
    fn sanitize_disables_absurd_recipok_cap() {
        let mut s = Settings {
            max_workers: 4,
            max_recipok_per_domain: 4,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.max_recipok_per_domain, 0);

        let mut s = Settings {
            max_workers: 4,
            max_recipok_per_domain: 3,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.max_recipok_per_domain, 3);
    }

    #[test]
    fn sanitize_floors_timeouts() {
        let mut s = Settings {
            max_idle_time: 1,
            busy_timeout: 0,
            client_timeout: 2,
            slew_time: 0,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.max_idle_time, 10);
        assert_eq!(s.busy_timeout, 10);
        assert_eq!(s.client_timeout, 10);
        assert_eq!(s.slew_time, 1);
    }

    #[test]
    fn default_socket_lands_in_spool_dir() {
        let mut s = Settings {
            spool_dir: PathBuf::from("/tmp/spool"),
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.sock_path, PathBuf::from("/tmp/spool/scanmux.sock"));
    }

    #[test]
    fn backlog_derived_from_pool_size() {
        let mut s = Settings {
            max_workers: 100,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.effective_backlog(), 25);

        s.max_workers = 4;
        assert_eq!(s.effective_backlog(), 5);

        s.listen_backlog = Some(1000);
        assert_eq!(s.effective_backlog(), 200);
    }
}

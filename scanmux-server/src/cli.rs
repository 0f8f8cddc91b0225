//! Command-line surface.
//!
//! The single-letter options are a stable operational interface used
//! by init scripts; they map one-to-one onto [`Settings`] fields plus
//! a handful of server-only options. Out-of-range values are clamped
//! by `Settings::sanitize`, not rejected.

use std::path::PathBuf;

use clap::Parser;
use scanmux_core::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "scanmux-server",
    about = "Worker-pool multiplexor for filter worker processes",
    disable_version_flag = true
)]
pub struct Cli {
    /// Minimum number of workers to keep running
    #[arg(short = 'm', long = "min-workers", value_name = "N")]
    pub min_workers: Option<usize>,

    /// Maximum possible number of workers
    #[arg(short = 'x', long = "max-workers", value_name = "N")]
    pub max_workers: Option<usize>,

    /// Maximum concurrent recipok checks per domain (0 = unlimited)
    #[arg(short = 'y', long = "recipok-per-domain", value_name = "N")]
    pub recipok_per_domain: Option<usize>,

    /// Maximum number of requests per worker
    #[arg(short = 'r', long = "max-requests", value_name = "N")]
    pub max_requests: Option<u32>,

    /// Maximum lifetime of a worker in seconds (<= 0 = unlimited)
    #[arg(short = 'V', long = "max-lifetime", value_name = "SECS")]
    pub max_lifetime: Option<i64>,

    /// Idle time (seconds) for killing excess workers
    #[arg(short = 'i', long = "idle-time", value_name = "SECS")]
    pub idle_time: Option<u64>,

    /// Busy time (seconds) for killing hung workers
    #[arg(short = 'b', long = "busy-time", value_name = "SECS")]
    pub busy_time: Option<u64>,

    /// Request/reply transmission timeout (seconds)
    #[arg(short = 'c', long = "client-time", value_name = "SECS")]
    pub client_time: Option<u64>,

    /// How long to wait between worker activations (seconds)
    #[arg(short = 'w', long = "slew", value_name = "SECS")]
    pub slew: Option<u64>,

    /// Absolute minimum wait between any two worker activations
    #[arg(short = 'W', long = "activation-wait", value_name = "SECS")]
    pub activation_wait: Option<u64>,

    /// UNIX-domain socket for commands
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Socket for unprivileged commands
    #[arg(short = 'a', long = "unpriv-socket", value_name = "PATH")]
    pub unpriv_socket: Option<PathBuf>,

    /// Socket for notification subscribers
    #[arg(short = 'O', long = "notify-socket", value_name = "PATH")]
    pub notify_socket: Option<PathBuf>,

    /// Socket for map requests (unix path or host:port)
    #[arg(short = 'N', long = "map-socket", value_name = "ADDR")]
    pub map_socket: Option<String>,

    /// Spool directory
    #[arg(short = 'z', long = "spool-dir", value_name = "DIR")]
    pub spool_dir: Option<PathBuf>,

    /// Full path of the filter worker program
    #[arg(short = 'f', long = "filter", value_name = "PATH")]
    pub filter: Option<PathBuf>,

    /// Sub-filter passed to the worker via -f
    #[arg(short = 'F', long = "sub-filter", value_name = "NAME")]
    pub sub_filter: Option<String>,

    /// Write process-ID to this file
    #[arg(short = 'p', long = "pidfile", value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Use this file as the single-instance lock
    #[arg(short = 'o', long = "lockfile", value_name = "PATH")]
    pub lockfile: Option<PathBuf>,

    /// Run as this user instead of root
    #[arg(short = 'U', long = "user", value_name = "USER")]
    pub run_as_user: Option<String>,

    /// Log facility name (accepted for compatibility; logging goes
    /// through the tracing subscriber)
    #[arg(short = 'S', long = "log-facility", value_name = "NAME")]
    pub log_facility: Option<String>,

    /// Log label (accepted for compatibility)
    #[arg(short = 'Y', long = "log-label", value_name = "LABEL")]
    pub log_label: Option<String>,

    /// Log worker status every this many seconds
    #[arg(short = 'L', long = "status-interval", value_name = "SECS")]
    pub status_interval: Option<u64>,

    /// Size of the deferred-request queue (0 = disabled)
    #[arg(short = 'q', long = "queue-size", value_name = "N")]
    pub queue_size: Option<usize>,

    /// Timeout for queued requests (seconds)
    #[arg(short = 'Q', long = "queue-timeout", value_name = "SECS")]
    pub queue_timeout: Option<u64>,

    /// listen(2) backlog for the command socket
    #[arg(short = 'I', long = "backlog", value_name = "N")]
    pub backlog: Option<i32>,

    /// Do not become a daemon (stay in foreground)
    #[arg(short = 'D', long = "no-daemon")]
    pub no_daemon: bool,

    /// Run a "tick" request every this many seconds
    #[arg(short = 'X', long = "tick-interval", value_name = "SECS")]
    pub tick_interval: Option<u64>,

    /// Number of parallel tick requests
    #[arg(short = 'P', long = "num-ticks", value_name = "N")]
    pub num_ticks: Option<usize>,

    /// Make sockets group-accessible
    #[arg(short = 'G', long = "group-access")]
    pub group_access: bool,

    /// Accept and process status updates from busy workers
    #[arg(short = 'Z', long = "status-reports")]
    pub status_reports: bool,

    /// Limit worker RSS to this many kB
    #[arg(short = 'R', long = "max-rss", value_name = "KB")]
    pub max_rss: Option<u64>,

    /// Historical address-space limit; parsed and ignored
    #[arg(short = 'M', long = "max-as", value_name = "KB", hide = true)]
    pub max_as: Option<u64>,

    /// Log statistics to this file
    #[arg(short = 't', long = "stats-file", value_name = "PATH")]
    pub stats_file: Option<PathBuf>,

    /// Mirror statistics into the normal log
    #[arg(short = 'T', long = "stats-to-log")]
    pub stats_to_log: bool,

    /// Flush the stats file after each write
    #[arg(short = 'u', long = "flush-stats")]
    pub flush_stats: bool,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

/// Options consumed by the server shell rather than the engine.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub pidfile: Option<PathBuf>,
    pub lockfile: Option<PathBuf>,
    pub run_as_user: Option<String>,
    pub no_daemon: bool,
    pub stats_file: Option<PathBuf>,
    pub stats_to_log: bool,
    pub flush_stats: bool,
}

impl Cli {
    pub fn into_parts(self) -> (Settings, ServerOptions) {
        let mut s = Settings::default();
        if let Some(v) = self.min_workers {
            s.min_workers = v;
        }
        if let Some(v) = self.max_workers {
            s.max_workers = v;
        }
        if let Some(v) = self.recipok_per_domain {
            s.max_recipok_per_domain = v;
        }
        if let Some(v) = self.max_requests {
            s.max_requests = v;
        }
        if let Some(v) = self.max_lifetime {
            s.max_lifetime = if v > 0 { Some(v as u64) } else { None };
        }
        if let Some(v) = self.idle_time {
            s.max_idle_time = v;
        }
        if let Some(v) = self.busy_time {
            s.busy_timeout = v;
        }
        if let Some(v) = self.client_time {
            s.client_timeout = v;
        }
        if let Some(v) = self.slew {
            s.slew_time = v;
        }
        if let Some(v) = self.activation_wait {
            s.wait_time = v;
        }
        if let Some(v) = self.socket {
            s.sock_path = v;
        }
        s.unpriv_sock_path = self.unpriv_socket;
        s.notify_sock_path = self.notify_socket;
        s.map_sock = self.map_socket;
        if let Some(v) = self.spool_dir {
            s.spool_dir = v;
        }
        if let Some(v) = self.filter {
            s.prog_path = v;
        }
        s.sub_filter = self.sub_filter;
        if let Some(v) = self.status_interval {
            s.log_status_interval = v;
        }
        if let Some(v) = self.queue_size {
            s.queue_size = v;
        }
        if let Some(v) = self.queue_timeout {
            s.queue_timeout = v;
        }
        s.listen_backlog = self.backlog;
        if let Some(v) = self.tick_interval {
            s.tick_interval = v;
        }
        if let Some(v) = self.num_ticks {
            s.num_ticks = v;
        }
        s.want_status_reports = self.status_reports;
        s.max_rss_kb = self.max_rss;
        s.group_access = self.group_access;

        let opts = ServerOptions {
            pidfile: self.pidfile,
            lockfile: self.lockfile,
            run_as_user: self.run_as_user,
            no_daemon: self.no_daemon,
            stats_file: self.stats_file,
            stats_to_log: self.stats_to_log,
            flush_stats: self.flush_stats,
        };
        (s, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_classic_option_set() {
        let cli = Cli::parse_from([
            "scanmux-server",
            "-m",
            "2",
            "-x",
            "8",
            "-q",
            "16",
            "-Q",
            "25",
            "-s",
            "/tmp/mux.sock",
            "-f",
            "/usr/bin/filter",
            "-D",
            "-Z",
        ]);
        let (mut settings, opts) = cli.into_parts();
        settings.sanitize();
        assert_eq!(settings.min_workers, 2);
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.queue_size, 16);
        assert_eq!(settings.queue_timeout, 25);
        assert_eq!(settings.sock_path, PathBuf::from("/tmp/mux.sock"));
        assert!(settings.want_status_reports);
        assert!(opts.no_daemon);
    }

    #[test]
    fn nonpositive_lifetime_means_unlimited() {
        let cli = Cli::parse_from(["scanmux-server", "-V", "0"]);
        let (settings, _) = cli.into_parts();
        assert_eq!(settings.max_lifetime, None);

        let cli = Cli::parse_from(["scanmux-server", "-V", "3600"]);
        let (settings, _) = cli.into_parts();
        assert_eq!(settings.max_lifetime, Some(3600));
    }

    #[test]
    fn historical_address_space_flag_is_accepted() {
        let cli = Cli::parse_from(["scanmux-server", "-M", "65536"]);
        assert_eq!(cli.max_as, Some(65536));
        let (settings, _) = cli.into_parts();
        // -M has no effect on the resulting configuration.
        assert_eq!(settings.max_rss_kb, None);
    }
}

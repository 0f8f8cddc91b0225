//! Optional statistics event log.
//!
//! One line per pool event (`StartWorker`, `KillWorker`, `ReapWorker`,
//! `StartFilter`, `EndFilter`) with a local timestamp, the epoch time
//! with milliseconds, the slot involved, and the pool census at that
//! moment. SIGHUP closes and reopens the file so logrotate can do its
//! job.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use tracing::{error, info};

#[derive(Debug)]
pub struct StatsLog {
    path: Option<PathBuf>,
    file: Option<File>,
    mirror_to_log: bool,
    flush: bool,
}

impl StatsLog {
    pub fn new(path: Option<PathBuf>, mirror_to_log: bool, flush: bool) -> Self {
        let mut stats = Self {
            path,
            file: None,
            mirror_to_log,
            flush,
        };
        stats.reopen();
        stats
    }

    pub fn reopen(&mut self) {
        self.file = None;
        let Some(path) = &self.path else { return };
        match OpenOptions::new().append(true).create(true).open(path) {
            Ok(f) => self.file = Some(f),
            Err(e) => error!("could not open stats file {}: {e}", path.display()),
        }
    }

    pub fn log(&mut self, event: &str, worker: i64, nworkers: usize, nbusy: usize, extra: &str) {
        if self.file.is_none() && !self.mirror_to_log {
            return;
        }
        let now = Local::now();
        let mut line = format!(
            "{} {}.{:03} {event} worker={worker} nworkers={nworkers} nbusy={nbusy}",
            now.format("%d/%m/%Y:%H:%M:%S"),
            now.timestamp(),
            now.timestamp_subsec_millis(),
        );
        if !extra.is_empty() {
            line.push(' ');
            line.push_str(extra);
        }

        if let Some(f) = &mut self.file {
            let write_failed = writeln!(f, "{line}").is_err() || (self.flush && f.flush().is_err());
            if write_failed {
                error!("write to stats file failed");
            }
        }
        if self.mirror_to_log {
            // The timestamp prefix is redundant in the log.
            let brief = line.split_once(' ').map(|(_, rest)| rest).unwrap_or(&line);
            info!("stats {brief}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.log");
        let mut stats = StatsLog::new(Some(path.clone()), false, true);
        stats.log("StartWorker", 0, 1, 0, "reason=\"test\"");
        stats.log("ReapWorker", 0, 0, 0, "");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("StartWorker worker=0 nworkers=1 nbusy=0 reason=\"test\""));
        assert!(lines[1].ends_with("ReapWorker worker=0 nworkers=0 nbusy=0"));
    }

    #[test]
    fn reopen_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.log");
        let mut stats = StatsLog::new(Some(path.clone()), false, true);
        stats.log("StartWorker", 0, 1, 0, "");

        let rotated = dir.path().join("stats.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        stats.reopen();
        stats.log("KillWorker", 0, 1, 0, "");

        assert!(std::fs::read_to_string(&rotated).unwrap().contains("StartWorker"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("KillWorker"));
    }

    #[test]
    fn disabled_stats_are_a_no_op() {
        let mut stats = StatsLog::new(None, false, false);
        stats.log("StartWorker", 0, 1, 0, "");
    }
}

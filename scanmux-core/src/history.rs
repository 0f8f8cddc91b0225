//! Sliding-window load history.
//!
//! Two ring structures per tracked command: one bucket per second for
//! the last ten minutes, one bucket per hour for the last day. Each
//! bucket stamps the absolute second (or hour) index it represents in
//! `elapsed`; a bucket whose stamp does not match the current index is
//! stale and is lazily zeroed when next written. Reads simply skip
//! buckets whose stamp falls outside the queried window, so neither
//! path ever sweeps the rings.

use crate::command::CommandKind;

/// Seconds of per-second history kept.
pub const HISTORY_SECONDS: u64 = 600;
/// Hours of per-hour history kept.
pub const HISTORY_HOURS: u64 = 24;

const NUM_TRACKED: usize = CommandKind::TRACKED.len();

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Absolute second (or hour) index this bucket currently holds.
    elapsed: i64,
    count: u64,
    workers: u64,
    ms: u64,
    activated: u64,
    reaped: u64,
    /// First and last write time, hourly ring only.
    first: u64,
    last: u64,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            elapsed: -1,
            count: 0,
            workers: 0,
            ms: 0,
            activated: 0,
            reaped: 0,
            first: 0,
            last: 0,
        }
    }
}

impl Bucket {
    fn clear_for(&mut self, index: i64) {
        *self = Bucket {
            elapsed: index,
            ..Bucket::default()
        };
    }
}

/// Windowed totals from the per-second ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub count: u64,
    pub workers: u64,
    pub ms: u64,
    pub activated: u64,
    pub reaped: u64,
}

impl Totals {
    fn add(&mut self, b: &Bucket) {
        self.count += b.count;
        self.workers += b.workers;
        self.ms += b.ms;
        self.activated += b.activated;
        self.reaped += b.reaped;
    }
}

/// Windowed totals from the hourly ring. `secs` is the wall-clock
/// span actually covered by the summed buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HourlyTotals {
    pub count: u64,
    pub workers: u64,
    pub ms: u64,
    pub secs: u64,
}

#[derive(Debug)]
pub struct History {
    seconds: Vec<Vec<Bucket>>,
    hours: Vec<Vec<Bucket>>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self {
            seconds: vec![vec![Bucket::default(); HISTORY_SECONDS as usize]; NUM_TRACKED],
            hours: vec![vec![Bucket::default(); HISTORY_HOURS as usize]; NUM_TRACKED],
        }
    }

    fn second_bucket(&mut self, cmd: usize, now: u64) -> &mut Bucket {
        let index = now as i64;
        let b = &mut self.seconds[cmd][(now % HISTORY_SECONDS) as usize];
        if b.elapsed != index {
            b.clear_for(index);
        }
        b
    }

    fn hour_bucket(&mut self, cmd: usize, now: u64) -> &mut Bucket {
        let index = (now / 3600) as i64;
        let b = &mut self.hours[cmd][((now / 3600) % HISTORY_HOURS) as usize];
        if b.elapsed != index {
            b.clear_for(index);
            b.first = now;
        }
        b.last = now;
        b
    }

    /// Record one completed request: when it finished, how many
    /// workers were busy at that moment, and how long it took.
    pub fn record_request(&mut self, kind: CommandKind, now: u64, busy_workers: u64, ms: u64) {
        let Some(cmd) = kind.history_index() else {
            return;
        };
        let b = self.second_bucket(cmd, now);
        b.count += 1;
        b.workers += busy_workers;
        b.ms += ms;
        let b = self.hour_bucket(cmd, now);
        b.count += 1;
        b.workers += busy_workers;
        b.ms += ms;
    }

    /// Record a worker activation (tracked under the scan ring).
    pub fn record_activation(&mut self, now: u64) {
        self.second_bucket(0, now).activated += 1;
    }

    /// Record a worker reap (tracked under the scan ring).
    pub fn record_reap(&mut self, now: u64) {
        self.second_bucket(0, now).reaped += 1;
    }

    /// Sum the seconds `(now - back, now]`. `back` must be in
    /// `1..=600`.
    pub fn totals(&self, kind: CommandKind, now: u64, back: u64) -> Option<Totals> {
        let cmd = kind.history_index()?;
        if back == 0 || back > HISTORY_SECONDS {
            return None;
        }
        let mut t = Totals::default();
        let start = now.saturating_sub(back - 1);
        for i in start..=now {
            let b = &self.seconds[cmd][(i % HISTORY_SECONDS) as usize];
            if b.elapsed == i as i64 {
                t.add(b);
            }
        }
        Some(t)
    }

    /// Sum the last `hours` hour buckets. `hours` must be in `1..=24`.
    pub fn hourly_totals(&self, kind: CommandKind, now: u64, hours: u64) -> Option<HourlyTotals> {
        let cmd = kind.history_index()?;
        if hours == 0 || hours > HISTORY_HOURS {
            return None;
        }
        let end = now / 3600;
        let start = end.saturating_sub(hours - 1);
        let mut t = HourlyTotals::default();
        let mut first: Option<u64> = None;
        let mut last: u64 = 0;
        for i in start..=end {
            let b = &self.hours[cmd][(i % HISTORY_HOURS) as usize];
            if b.elapsed == i as i64 {
                t.count += b.count;
                t.workers += b.workers;
                t.ms += b.ms;
                first = Some(first.map_or(b.first, |f| f.min(b.first)));
                last = last.max(b.last);
            }
        }
        if let Some(f) = first {
            t.secs = last.saturating_sub(f);
        }
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    #[test]
    fn window_sums_only_requested_span() {
        let mut h = History::new();
        h.record_request(CommandKind::Scan, NOW - 20, 2, 100);
        h.record_request(CommandKind::Scan, NOW - 5, 3, 200);
        h.record_request(CommandKind::Scan, NOW, 1, 50);

        let t = h.totals(CommandKind::Scan, NOW, 10).unwrap();
        assert_eq!(t.count, 2);
        assert_eq!(t.workers, 4);
        assert_eq!(t.ms, 250);

        let t = h.totals(CommandKind::Scan, NOW, 600).unwrap();
        assert_eq!(t.count, 3);
    }

    #[test]
    fn commands_do_not_bleed_into_each_other() {
        let mut h = History::new();
        h.record_request(CommandKind::Scan, NOW, 1, 10);
        h.record_request(CommandKind::RecipOk, NOW, 1, 10);

        assert_eq!(h.totals(CommandKind::Scan, NOW, 10).unwrap().count, 1);
        assert_eq!(h.totals(CommandKind::RecipOk, NOW, 10).unwrap().count, 1);
        assert_eq!(h.totals(CommandKind::RelayOk, NOW, 10).unwrap().count, 0);
    }

    #[test]
    fn stale_buckets_are_lazily_recycled() {
        let mut h = History::new();
        h.record_request(CommandKind::Scan, NOW, 5, 100);
        // Same ring slot, one full revolution later.
        h.record_request(CommandKind::Scan, NOW + HISTORY_SECONDS, 1, 10);

        let t = h
            .totals(CommandKind::Scan, NOW + HISTORY_SECONDS, 10)
            .unwrap();
        assert_eq!(t.count, 1);
        assert_eq!(t.workers, 1);
        assert_eq!(t.ms, 10);
    }

    #[test]
    fn out_of_range_windows_are_rejected() {
        let h = History::new();
        assert!(h.totals(CommandKind::Scan, NOW, 0).is_none());
        assert!(h.totals(CommandKind::Scan, NOW, 601).is_none());
        assert!(h.totals(CommandKind::Other, NOW, 10).is_none());
        assert!(h.hourly_totals(CommandKind::Scan, NOW, 25).is_none());
    }

    #[test]
    fn activations_and_reaps_live_in_the_scan_ring() {
        let mut h = History::new();
        h.record_activation(NOW);
        h.record_activation(NOW);
        h.record_reap(NOW + 1);

        let t = h.totals(CommandKind::Scan, NOW + 1, 10).unwrap();
        assert_eq!(t.activated, 2);
        assert_eq!(t.reaped, 1);
        assert_eq!(h.totals(CommandKind::RelayOk, NOW + 1, 10).unwrap().activated, 0);
    }

    #[test]
    fn hourly_span_tracks_first_and_last_write() {
        let mut h = History::new();
        let base = NOW - (NOW % 3600);
        h.record_request(CommandKind::Scan, base + 100, 1, 10);
        h.record_request(CommandKind::Scan, base + 500, 1, 10);

        let t = h.hourly_totals(CommandKind::Scan, base + 600, 1).unwrap();
        assert_eq!(t.count, 2);
        assert_eq!(t.secs, 400);
    }

    #[test]
    fn workers_at_least_count_in_every_bucket() {
        let mut h = History::new();
        for i in 0..50 {
            h.record_request(CommandKind::Scan, NOW + i, 1 + i % 3, 5);
        }
        let t = h.totals(CommandKind::Scan, NOW + 49, 60).unwrap();
        assert!(t.workers >= t.count);
    }
}

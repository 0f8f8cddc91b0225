//! Renderers for the control-protocol report verbs.
//!
//! Every function here turns a snapshot of the pool and history into
//! the exact reply bytes for one verb. The numeric formats are part of
//! the wire protocol: monitoring front-ends parse them positionally,
//! so fields are whitespace-separated in a fixed order and floats
//! carry six decimals.

use serde::Serialize;

use crate::command::CommandKind;
use crate::history::History;
use crate::pool::{WorkerPool, WorkerState};
use crate::settings::Settings;

/// Snapshot handed to every renderer.
#[derive(Debug, Clone, Copy)]
pub struct ReportCtx<'a> {
    pub pool: &'a WorkerPool,
    pub history: &'a History,
    pub settings: &'a Settings,
    /// Messages processed (scan commands completed) since startup.
    pub num_msgs: u64,
    /// Requests currently parked in the queue.
    pub queued: usize,
    /// Unix time the supervisor started.
    pub start_time: u64,
    pub now: u64,
}

impl ReportCtx<'_> {
    fn uptime(&self) -> u64 {
        self.now.saturating_sub(self.start_time)
    }

    fn state_chars(&self) -> String {
        self.pool.iter().map(|s| s.state().code()).collect()
    }
}

/// `status`: one character per slot plus the five global counters.
pub fn status(ctx: &ReportCtx) -> String {
    format!(
        "{} {} {} {} {} {}\n",
        ctx.state_chars(),
        ctx.num_msgs,
        ctx.pool.activations(),
        ctx.settings.queue_size,
        ctx.queued,
        ctx.uptime()
    )
}

#[derive(Serialize)]
struct JsonStatus<'a> {
    workers: &'a str,
    msgs: u64,
    activations: u64,
    queue_size: usize,
    queued: usize,
    uptime: u64,
}

/// `jsonstatus`: the `status` data as a JSON object.
pub fn json_status(ctx: &ReportCtx) -> String {
    let chars = ctx.state_chars();
    let body = JsonStatus {
        workers: &chars,
        msgs: ctx.num_msgs,
        activations: ctx.pool.activations(),
        queue_size: ctx.settings.queue_size,
        queued: ctx.queued,
        uptime: ctx.uptime(),
    };
    match serde_json::to_string(&body) {
        Ok(s) => s + "\n",
        Err(_) => "error: JSON rendering failed\n".to_string(),
    }
}

/// `workers` / `busyworkers`: one human-readable line per slot.
pub fn worker_report(ctx: &ReportCtx, only_busy: bool) -> String {
    let mut out = String::new();
    for (i, s) in ctx.pool.iter().enumerate() {
        if only_busy && s.state() != WorkerState::Busy {
            continue;
        }
        out.push_str(&format!("{i} {}", s.state().code()));
        if s.state() != WorkerState::Stopped {
            out.push_str(&format!(" {}", s.pid.unwrap_or(-1)));
        }
        if s.state() == WorkerState::Busy {
            if let Some(cmd) = s.cmd.filter(|c| c.history_index().is_some()) {
                out.push_str(&format!(" {}", cmd.name()));
            }
        }
        if let Some(last) = s.last_cmd.filter(|c| c.history_index().is_some()) {
            out.push_str(&format!(" last={}", last.name()));
        }
        out.push_str(&format!(
            " ago={}",
            ctx.now.saturating_sub(s.last_state_change)
        ));
        if !s.status_tag.is_empty() {
            out.push_str(&format!(" ({})", s.status_tag));
        }
        out.push('\n');
    }
    out
}

/// `workerinfo <n>`: multi-line detail for one slot. Ages are -1 when
/// the stamp does not exist yet.
pub fn worker_info(ctx: &ReportCtx, idx: usize) -> String {
    let s = ctx.pool.slot(idx);
    let age = |t: Option<u64>| t.map_or(-1, |v| v as i64);
    format!(
        "Worker {idx}\nState {}\nPID {}\nNumRequests {}\nNumScans {}\nAge {}\nFirstReqAge {}\nLastStateChangeAge {}\nStatusTag {}\n",
        s.state().name(),
        s.pid.unwrap_or(-1),
        s.num_requests,
        s.num_scans,
        age(s.age(ctx.now)),
        age(s.request_age(ctx.now)),
        ctx.now.saturating_sub(s.last_state_change),
        s.status_tag
    )
}

fn counts_line(ctx: &ReportCtx) -> String {
    format!(
        "{} {} {} {}",
        ctx.pool.count(WorkerState::Busy),
        ctx.pool.count(WorkerState::Idle),
        ctx.pool.count(WorkerState::Stopped),
        ctx.pool.count(WorkerState::Killed)
    )
}

/// `load` and its per-command variants: nested windows of 10 s, 1 m,
/// 5 m, and 10 m. Each window accumulates the previous one so the
/// four figures are "within the last N", not disjoint slices.
pub fn load(ctx: &ReportCtx, kind: CommandKind) -> String {
    // Query disjoint slices so nothing is counted twice, then
    // accumulate.
    let now = ctx.now;
    let windows = [
        (now, 10),
        (now.saturating_sub(10), 50),
        (now.saturating_sub(60), 240),
        (now.saturating_sub(300), 300),
    ];
    let mut acc = [crate::history::Totals::default(); 4];
    let mut run = crate::history::Totals::default();
    for (i, &(end, back)) in windows.iter().enumerate() {
        if let Some(t) = ctx.history.totals(kind, end, back) {
            run.count += t.count;
            run.workers += t.workers;
            run.ms += t.ms;
            run.activated += t.activated;
            run.reaped += t.reaped;
        }
        acc[i] = run;
    }

    let avg = |t: &crate::history::Totals| {
        if t.count == 0 {
            1.0
        } else {
            t.workers as f64 / t.count as f64
        }
    };
    let ams = |t: &crate::history::Totals| {
        if t.count == 0 {
            0.0
        } else {
            t.ms as f64 / t.count as f64
        }
    };

    format!(
        "{} {} {} {} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {} {} {} {} {} {} {} {} {} {} {} {} {} {}\n",
        acc[0].count,
        acc[1].count,
        acc[2].count,
        acc[3].count,
        avg(&acc[0]),
        avg(&acc[1]),
        avg(&acc[2]),
        avg(&acc[3]),
        ams(&acc[0]),
        ams(&acc[1]),
        ams(&acc[2]),
        ams(&acc[3]),
        acc[0].activated,
        acc[1].activated,
        acc[2].activated,
        acc[3].activated,
        acc[0].reaped,
        acc[1].reaped,
        acc[2].reaped,
        acc[3].reaped,
        counts_line(ctx),
        ctx.num_msgs,
        ctx.pool.activations(),
        ctx.settings.queue_size,
        ctx.queued,
        ctx.uptime()
    )
}

fn busy_counts_per_command(ctx: &ReportCtx) -> [usize; 4] {
    let mut counts = [0usize; 4];
    for s in ctx.pool.iter() {
        if s.state() == WorkerState::Busy {
            if let Some(i) = s.cmd.and_then(|c| c.history_index()) {
                counts[i] += 1;
            }
        }
    }
    counts
}

/// `load1 <back>`: one flat line covering a single window for all four
/// tracked commands, plus a live per-command busy census.
pub fn load1(ctx: &ReportCtx, back: u64) -> String {
    let mut out = String::new();
    for kind in CommandKind::TRACKED {
        let t = ctx.history.totals(kind, ctx.now, back).unwrap_or_default();
        let avg = if t.count == 0 {
            0.0
        } else {
            t.workers as f64 / t.count as f64
        };
        let ams = if t.count == 0 {
            0.0
        } else {
            t.ms as f64 / t.count as f64
        };
        out.push_str(&format!("{} {:.6} {:.6} ", t.count, avg, ams));
    }
    let busy = busy_counts_per_command(ctx);
    out.push_str(&format!(
        "{} {} {} {} {} {} {} {} {} {} {}\n",
        counts_line(ctx),
        ctx.num_msgs,
        ctx.pool.activations(),
        ctx.settings.queue_size,
        ctx.queued,
        ctx.uptime(),
        back,
        busy[0],
        busy[1],
        busy[2],
        busy[3]
    ));
    out
}

#[derive(Serialize)]
struct JsonLoadEntry {
    msgs: u64,
    avg_busy: f64,
    avg_ms: f64,
    busy_now: usize,
}

#[derive(Serialize)]
struct JsonLoad1 {
    back: u64,
    scan: JsonLoadEntry,
    relayok: JsonLoadEntry,
    senderok: JsonLoadEntry,
    recipok: JsonLoadEntry,
    busy: usize,
    idle: usize,
    stopped: usize,
    killed: usize,
    msgs: u64,
    activations: u64,
    queue_size: usize,
    queued: usize,
    uptime: u64,
}

/// `jsonload1 <back>`: the `load1` data as a JSON object.
pub fn json_load1(ctx: &ReportCtx, back: u64) -> String {
    let busy = busy_counts_per_command(ctx);
    let entry = |kind: CommandKind, busy_now: usize| {
        let t = ctx.history.totals(kind, ctx.now, back).unwrap_or_default();
        JsonLoadEntry {
            msgs: t.count,
            avg_busy: if t.count == 0 {
                0.0
            } else {
                t.workers as f64 / t.count as f64
            },
            avg_ms: if t.count == 0 {
                0.0
            } else {
                t.ms as f64 / t.count as f64
            },
            busy_now,
        }
    };
    let body = JsonLoad1 {
        back,
        scan: entry(CommandKind::Scan, busy[0]),
        relayok: entry(CommandKind::RelayOk, busy[1]),
        senderok: entry(CommandKind::SenderOk, busy[2]),
        recipok: entry(CommandKind::RecipOk, busy[3]),
        busy: ctx.pool.count(WorkerState::Busy),
        idle: ctx.pool.count(WorkerState::Idle),
        stopped: ctx.pool.count(WorkerState::Stopped),
        killed: ctx.pool.count(WorkerState::Killed),
        msgs: ctx.num_msgs,
        activations: ctx.pool.activations(),
        queue_size: ctx.settings.queue_size,
        queued: ctx.queued,
        uptime: ctx.uptime(),
    };
    match serde_json::to_string(&body) {
        Ok(s) => s + "\n",
        Err(_) => "error: JSON rendering failed\n".to_string(),
    }
}

/// `hload` and friends: totals over the last 1, 4, 12, and 24 hours,
/// with the wall-clock span each figure actually covers.
pub fn hourly_load(ctx: &ReportCtx, kind: CommandKind) -> String {
    let hours = [1u64, 4, 12, 24];
    let totals: Vec<_> = hours
        .iter()
        .map(|&h| {
            ctx.history
                .hourly_totals(kind, ctx.now, h)
                .unwrap_or_default()
        })
        .collect();
    let avg = |t: &crate::history::HourlyTotals| {
        if t.count == 0 {
            0.0
        } else {
            t.workers as f64 / t.count as f64
        }
    };
    let ams = |t: &crate::history::HourlyTotals| {
        if t.count == 0 {
            0.0
        } else {
            t.ms as f64 / t.count as f64
        }
    };
    format!(
        "{} {} {} {} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {} {} {} {}\n",
        totals[0].count,
        totals[1].count,
        totals[2].count,
        totals[3].count,
        avg(&totals[0]),
        avg(&totals[1]),
        avg(&totals[2]),
        avg(&totals[3]),
        ams(&totals[0]),
        ams(&totals[1]),
        ams(&totals[2]),
        ams(&totals[3]),
        totals[0].secs,
        totals[1].secs,
        totals[2].secs,
        totals[3].secs
    )
}

/// `histo`: one line per slot, `<n> <count>` where count is how often
/// the pool reached n simultaneously busy workers.
pub fn histogram(ctx: &ReportCtx) -> String {
    let mut out = String::new();
    for (i, s) in ctx.pool.iter().enumerate() {
        out.push_str(&format!("{:4} {}\n", i + 1, s.histo));
    }
    out
}

/// `help`: the verb list, trimmed to what the caller may actually use.
pub fn help(privileged: bool) -> String {
    let common = "\
help             -- List available multiplexor commands\n\
free             -- Display number of free workers\n\
status           -- Display worker status\n\
jsonstatus       -- Display worker status in JSON format\n\
load             -- Display worker load (scans)\n\
load1 secs       -- Display worker load in alternate format\n\
jsonload1 secs   -- Display worker load in JSON format\n\
load-relayok     -- Display load (relayok requests)\n\
load-senderok    -- Display load (senderok requests)\n\
load-recipok     -- Display load (recipok requests)\n\
histo            -- Display histogram of busy workers\n\
msgs             -- Display number of messages processed since startup\n\
workers          -- Display workers with process-IDs\n\
busyworkers      -- Display busy workers with process-IDs\n\
workerinfo n     -- Display information about a particular worker\n\
version          -- Display multiplexor version\n\
(Analogous hload commands provide hourly information)\n";
    if privileged {
        format!(
            "{common}\
rawstatus        -- Display worker status (same as status)\n\
reread           -- Force a re-read of filter rules\n\
scan qid dir     -- Run a scan\n"
        )
    } else {
        common.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;

    fn fixture() -> (WorkerPool, History, Settings) {
        let mut settings = Settings::default();
        settings.max_workers = 4;
        settings.queue_size = 8;
        settings.sanitize();
        let mut pool = WorkerPool::new(4, 1000);
        let seq = pool.next_activation_seq();
        {
            let s = pool.slot_mut(0);
            s.pid = Some(4242);
            s.activated = seq;
            s.activation_time = Some(1000);
            s.idle_since = 1000;
        }
        pool.set_state(0, WorkerState::Idle, 1000);
        (pool, History::new(), settings)
    }

    #[test]
    fn status_line_layout() {
        let (pool, history, settings) = fixture();
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 7,
            queued: 2,
            start_time: 900,
            now: 1010,
        };
        assert_eq!(status(&ctx), "ISSS 7 1 8 2 110\n");
    }

    #[test]
    fn histogram_layout() {
        let (mut pool, history, settings) = fixture();
        pool.set_state(0, WorkerState::Busy, 1001);
        pool.set_state(0, WorkerState::Idle, 1002);
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 0,
            queued: 0,
            start_time: 900,
            now: 1010,
        };
        assert_eq!(histogram(&ctx), "   1 1\n   2 0\n   3 0\n   4 0\n");
    }

    #[test]
    fn worker_info_layout() {
        let (pool, history, settings) = fixture();
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 0,
            queued: 0,
            start_time: 900,
            now: 1010,
        };
        let info = worker_info(&ctx, 0);
        assert_eq!(
            info,
            "Worker 0\nState Idle\nPID 4242\nNumRequests 0\nNumScans 0\nAge 10\nFirstReqAge -1\nLastStateChangeAge 10\nStatusTag \n"
        );
        let info = worker_info(&ctx, 3);
        assert!(info.contains("State Stopped"));
        assert!(info.contains("PID -1"));
        assert!(info.contains("Age -1"));
    }

    #[test]
    fn worker_report_skips_non_busy_when_asked() {
        let (mut pool, history, settings) = fixture();
        pool.set_state(0, WorkerState::Busy, 1001);
        pool.slot_mut(0).cmd = Some(CommandKind::Scan);
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 0,
            queued: 0,
            start_time: 900,
            now: 1003,
        };
        let full = worker_report(&ctx, false);
        assert_eq!(full.lines().count(), 4);
        let busy = worker_report(&ctx, true);
        assert_eq!(busy, "0 B 4242 scan ago=2\n");
    }

    #[test]
    fn load_reports_nested_windows() {
        let (pool, mut history, settings) = fixture();
        let now = 10_000;
        history.record_request(CommandKind::Scan, now - 5, 2, 100);
        history.record_request(CommandKind::Scan, now - 30, 1, 50);
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 2,
            queued: 0,
            start_time: 900,
            now,
        };
        let line = load(&ctx, CommandKind::Scan);
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 29);
        assert_eq!(fields[0], "1"); // last 10 seconds
        assert_eq!(fields[1], "2"); // last minute, cumulative
        assert_eq!(fields[4], "2.000000"); // avg busy in last 10 s
    }

    #[test]
    fn load1_layout() {
        let (pool, mut history, settings) = fixture();
        let now = 10_000;
        history.record_request(CommandKind::RecipOk, now - 2, 3, 30);
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 1,
            queued: 0,
            start_time: 900,
            now,
        };
        let line = load1(&ctx, 60);
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 26);
        assert_eq!(fields[9], "1"); // recipok count
        assert_eq!(fields[10], "3.000000"); // recipok avg busy
        assert_eq!(fields[21], "60"); // the window echoed back
    }

    #[test]
    fn json_status_is_parseable() {
        let (pool, history, settings) = fixture();
        let ctx = ReportCtx {
            pool: &pool,
            history: &history,
            settings: &settings,
            num_msgs: 3,
            queued: 0,
            start_time: 900,
            now: 1010,
        };
        let v: serde_json::Value =
            serde_json::from_str(json_status(&ctx).trim_end()).unwrap();
        assert_eq!(v["workers"], "ISSS");
        assert_eq!(v["msgs"], 3);
    }
}

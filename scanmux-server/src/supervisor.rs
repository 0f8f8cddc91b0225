//! The supervisor: one task that owns every piece of mutable state
//! and consumes a single event stream.
//!
//! Connection tasks, worker I/O tasks, drains, timers, and signal
//! forwarders all communicate with the supervisor exclusively through
//! [`Event`]s; replies travel back through per-request oneshot
//! channels. Because only this task touches the pool, the queue, the
//! history, and the listener registry, no two handlers for the same
//! worker can ever run concurrently and every state transition is
//! observed in order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{debug, error, info, warn};

use scanmux_core::command::{self, MAX_CMD_LEN, MAX_STATUS_LEN};
use scanmux_core::notify::{self, SubscriptionMask};
use scanmux_core::pool::WorkerState;
use scanmux_core::report::{self, ReportCtx};
use scanmux_core::{CommandKind, History, RequestQueue, Settings, WorkerPool, codec, unix_now};

use crate::notifier::{self, ListenerHandle};
use crate::stats::StatsLog;
use crate::worker_io::{self, WorkerIo};

/// Seconds between the stages of the kill escalation (EOF on stdin,
/// then SIGTERM, then SIGKILL).
const KILL_ESCALATION_SECS: u64 = 10;

/// Who is waiting for the reply to a request in flight.
#[derive(Debug)]
pub enum Origin {
    /// A command-socket connection; the reply is written verbatim.
    Client(oneshot::Sender<Vec<u8>>),
    /// A map-socket connection; the reply is percent-decoded and the
    /// conn task wraps it in a netstring.
    Map(oneshot::Sender<Vec<u8>>),
    /// A self-issued tick; the reply is discarded and the tick loop
    /// rescheduled.
    Tick(usize),
}

/// Result of one worker request round trip. Every variant returns the
/// worker descriptors so the supervisor decides their fate.
#[derive(Debug)]
pub enum IoOutcome {
    WriteFailed(WorkerIo),
    Reply(Vec<u8>, WorkerIo),
    Eof(WorkerIo),
    ReadError(WorkerIo),
    ReadTimeout(WorkerIo),
}

#[derive(Debug)]
pub enum Event {
    Control {
        line: String,
        privileged: bool,
        reply: oneshot::Sender<Vec<u8>>,
    },
    MapRequest {
        map: String,
        key: String,
        reply: oneshot::Sender<Vec<u8>>,
    },
    NotifyConn {
        stream: UnixStream,
    },
    ListenerSub {
        id: usize,
        mask: SubscriptionMask,
    },
    ListenerGone {
        id: usize,
    },
    RequestDone {
        slot: usize,
        outcome: IoOutcome,
    },
    WorkerOom {
        slot: usize,
        pid: i32,
    },
    WorkerStatusLine {
        slot: usize,
        pid: i32,
        line: String,
    },
    Reaped {
        slot: usize,
        pid: i32,
        status: ExitStatus,
    },
    KillTimerFired {
        slot: usize,
        pid: i32,
    },
    QueueTimeout {
        token: u64,
    },
    Tick {
        tick_no: usize,
    },
    BringUpToMin,
    Reload,
    ReopenStats,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum KillStage {
    /// Timer fire sends SIGTERM and arms the next stage.
    Term,
    /// Timer fire sends SIGKILL.
    Nuke,
}

/// Per-slot runtime baggage that cannot live in the core pool: live
/// descriptors, task handles, and the in-flight request context.
#[derive(Debug, Default)]
struct SlotRuntime {
    io: Option<WorkerIo>,
    pending: Option<AbortHandle>,
    kill_timer: Option<AbortHandle>,
    kill_stage: Option<KillStage>,
    origin: Option<Origin>,
    start_cmd: Option<Instant>,
}

impl SlotRuntime {
    fn clear_tasks(&mut self) {
        if let Some(h) = self.pending.take() {
            h.abort();
        }
        if let Some(h) = self.kill_timer.take() {
            h.abort();
        }
        self.kill_stage = None;
    }
}

struct QueuedRequest {
    line: String,
    origin: Origin,
}

pub struct Supervisor {
    settings: Settings,
    pool: WorkerPool,
    history: History,
    queue: RequestQueue<QueuedRequest>,
    runtime: Vec<SlotRuntime>,
    listeners: Vec<Option<ListenerHandle>>,
    queue_timers: HashMap<u64, AbortHandle>,
    stats: StatsLog,
    tx: UnboundedSender<Event>,
    /// Socket paths removed on shutdown.
    cleanup_paths: Vec<PathBuf>,
    num_msgs: u64,
    start_time: u64,
    last_activation: Option<u64>,
    min_refill_scheduled: bool,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        stats: StatsLog,
        tx: UnboundedSender<Event>,
        cleanup_paths: Vec<PathBuf>,
    ) -> Self {
        let now = unix_now();
        let max = settings.max_workers;
        Self {
            pool: WorkerPool::new(max, now),
            history: History::new(),
            queue: RequestQueue::new(settings.queue_size),
            runtime: (0..max).map(|_| SlotRuntime::default()).collect(),
            listeners: (0..notify::MAX_LISTENERS).map(|_| None).collect(),
            queue_timers: HashMap::new(),
            stats,
            tx,
            cleanup_paths,
            num_msgs: 0,
            start_time: now,
            last_activation: None,
            min_refill_scheduled: false,
            settings,
        }
    }

    /// Kick off startup work: the initial worker refill and the tick
    /// loops. All ticks start in step and drift apart on their own.
    pub fn start(&mut self) {
        self.bring_up_to_min();
        if self.settings.tick_interval > 0 {
            for n in 0..self.settings.num_ticks {
                self.schedule_tick(n);
            }
        }
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Event>) {
        let idle_period = Duration::from_secs(self.settings.max_idle_time);
        let mut idle_sweep = interval_at(tokio::time::Instant::now() + idle_period, idle_period);
        idle_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status_period = if self.settings.log_status_interval > 0 {
            Duration::from_secs(self.settings.log_status_interval)
        } else {
            // Effectively never; the handler is also gated.
            Duration::from_secs(86_400 * 365)
        };
        let mut status_log = interval_at(tokio::time::Instant::now() + status_period, status_period);
        status_log.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = rx.recv() => {
                    match ev {
                        None => break,
                        Some(Event::Shutdown) => {
                            self.shutdown(&mut rx).await;
                            break;
                        }
                        Some(ev) => self.handle(ev),
                    }
                }
                _ = idle_sweep.tick() => self.idle_sweep(),
                _ = status_log.tick() => self.log_status(),
            }
        }
    }

    fn handle(&mut self, ev: Event) {
        match ev {
            Event::Control {
                line,
                privileged,
                reply,
            } => self.handle_control(line, privileged, reply),
            Event::MapRequest { map, key, reply } => self.handle_map_request(map, key, reply),
            Event::NotifyConn { stream } => self.on_notify_conn(stream),
            Event::ListenerSub { id, mask } => {
                if let Some(Some(l)) = self.listeners.get_mut(id) {
                    l.mask = mask;
                }
            }
            Event::ListenerGone { id } => {
                if let Some(slot) = self.listeners.get_mut(id) {
                    *slot = None;
                }
            }
            Event::RequestDone { slot, outcome } => self.on_request_done(slot, outcome),
            Event::WorkerOom { slot, pid } => {
                if self.pool.slot(slot).pid == Some(pid) {
                    self.pool.slot_mut(slot).oom = true;
                }
            }
            Event::WorkerStatusLine { slot, pid, line } => self.on_status_line(slot, pid, &line),
            Event::Reaped { slot, pid, status } => self.on_reaped(slot, pid, status, false),
            Event::KillTimerFired { slot, pid } => self.on_kill_timer(slot, pid),
            Event::QueueTimeout { token } => self.on_queue_timeout(token),
            Event::Tick { tick_no } => self.on_tick(tick_no),
            Event::BringUpToMin => self.bring_up_to_min(),
            Event::Reload => {
                self.reload();
            }
            Event::ReopenStats => self.stats.reopen(),
            Event::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn ctx(&self) -> ReportCtx<'_> {
        ReportCtx {
            pool: &self.pool,
            history: &self.history,
            settings: &self.settings,
            num_msgs: self.num_msgs,
            queued: self.queue.len(),
            start_time: self.start_time,
            now: unix_now(),
        }
    }

    // ----- control protocol ------------------------------------------------

    fn handle_control(&mut self, line: String, privileged: bool, reply: oneshot::Sender<Vec<u8>>) {
        match self.control_reply(&line, privileged) {
            Some(msg) => {
                let _ = reply.send(msg.into_bytes());
            }
            None => {
                if line.len() >= MAX_CMD_LEN - 1 {
                    debug!("rejecting over-long command");
                    let _ = reply.send(b"error: Command too long\n".to_vec());
                    return;
                }
                self.dispatch_request(line, Origin::Client(reply), true);
            }
        }
    }

    /// Answer a control verb in place, or return `None` for commands
    /// that must be forwarded to a worker.
    fn control_reply(&mut self, line: &str, privileged: bool) -> Option<String> {
        let msg = match line {
            "help" => report::help(privileged),
            "free" => format!("{}\n", self.pool.free_workers()),
            "version" => format!(
                "{} version {}\n",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            // Ticks are self-issued only; two concurrent tick loops on
            // the same tick number would race.
            "tick" => "error: External agents may not invoke 'tick'\n".into(),
            "status" => report::status(&self.ctx()),
            "jsonstatus" => report::json_status(&self.ctx()),
            "workers" => report::worker_report(&self.ctx(), false),
            "busyworkers" => report::worker_report(&self.ctx(), true),
            "load" => report::load(&self.ctx(), CommandKind::Scan),
            "load-relayok" => report::load(&self.ctx(), CommandKind::RelayOk),
            "load-senderok" => report::load(&self.ctx(), CommandKind::SenderOk),
            "load-recipok" => report::load(&self.ctx(), CommandKind::RecipOk),
            "hload" => report::hourly_load(&self.ctx(), CommandKind::Scan),
            "hload-relayok" => report::hourly_load(&self.ctx(), CommandKind::RelayOk),
            "hload-senderok" => report::hourly_load(&self.ctx(), CommandKind::SenderOk),
            "hload-recipok" => report::hourly_load(&self.ctx(), CommandKind::RecipOk),
            "histo" => report::histogram(&self.ctx()),
            "msgs" => format!("{}\n", self.num_msgs),
            // Monitoring probe; answer directly instead of wasting a
            // worker on it.
            "foo_no_such_command" => "error: Unknown command\n".into(),
            _ if line.starts_with("workerinfo ") => {
                match line["workerinfo ".len()..].trim().parse::<i64>() {
                    Err(_) => "error: Invalid worker number\n".into(),
                    Ok(n) if n < 0 || n as usize >= self.pool.len() => {
                        "error: Worker number out of range\n".into()
                    }
                    Ok(n) => report::worker_info(&self.ctx(), n as usize),
                }
            }
            _ if line.starts_with("load1 ") || line.starts_with("jsonload1 ") => {
                let json = line.starts_with("jsonload1 ");
                let arg = line.split_once(' ').map(|(_, a)| a.trim()).unwrap_or("");
                match arg.parse::<u64>() {
                    Ok(back) if (10..=600).contains(&back) => {
                        if json {
                            report::json_load1(&self.ctx(), back)
                        } else {
                            report::load1(&self.ctx(), back)
                        }
                    }
                    _ => "error: Invalid 'back' amount (must be 10-600)\n".into(),
                }
            }
            _ if !privileged => {
                "error: Attempt to use privileged command on unprivileged socket\n".into()
            }
            "rawstatus" => report::status(&self.ctx()),
            "reread" => {
                self.reload();
                "Forced reread of filter rules\n".into()
            }
            _ => return None,
        };
        Some(msg)
    }

    fn handle_map_request(&mut self, map: String, key: String, reply: oneshot::Sender<Vec<u8>>) {
        let line = format!(
            "map {} {}",
            codec::percent_encode(map.as_bytes()),
            codec::percent_encode(key.as_bytes())
        );
        self.dispatch_request(line, Origin::Map(reply), false);
    }

    // ----- admission and dispatch ------------------------------------------

    /// Route one request to a worker: per-domain gate, worker
    /// selection, activation if the slot is cold, then the I/O task.
    fn dispatch_request(&mut self, line: String, origin: Origin, queueable: bool) {
        let kind = CommandKind::parse(&line);

        // Per-domain recipok cap, checked at admission only; dequeued
        // requests were already admitted.
        if queueable && kind == CommandKind::RecipOk && self.settings.max_recipok_per_domain > 0 {
            if let Some(domain) = command::domain_of(&line) {
                let busy = self.pool.busy_recipok_for_domain(&domain);
                if busy >= self.settings.max_recipok_per_domain {
                    warn!(
                        "hit per-domain recipok limit ({}) for domain {domain}",
                        self.settings.max_recipok_per_domain
                    );
                    self.fail_origin(
                        origin,
                        b"ok -1 Per-domain%20recipok%20limit%20hit;%20please%20try%20again%20later\n",
                        b"TEMP Per-domain recipok limit hit",
                    );
                    return;
                }
            }
        }

        let Some(idx) = self.pool.find_free(kind) else {
            self.reject_no_worker(line, origin, queueable);
            return;
        };

        if self.pool.slot(idx).state() == WorkerState::Stopped {
            let reason = match &origin {
                Origin::Client(_) if kind == CommandKind::Scan => {
                    "about to perform scan".to_string()
                }
                Origin::Client(_) => {
                    let head: String = line.chars().take(100).collect();
                    format!("about to execute command '{head}'")
                }
                Origin::Map(_) => "about to handle map request".to_string(),
                Origin::Tick(_) => "about to run tick".to_string(),
            };
            if self.activate(idx, &reason).is_err() {
                error!("unable to activate worker {idx}");
                self.fail_origin(
                    origin,
                    b"error: Unable to activate worker\n",
                    b"TEMP Unable to activate worker",
                );
                return;
            }
        }

        self.begin_command(idx, line, kind, origin);
    }

    /// No worker available: queue the request if allowed, otherwise
    /// turn the originator away.
    fn reject_no_worker(&mut self, line: String, origin: Origin, queueable: bool) {
        let origin = if queueable
            && matches!(origin, Origin::Client(_))
            && self.queue.capacity() > 0
        {
            match self.queue.push(QueuedRequest { line, origin }) {
                Ok(token) => {
                    let tx = self.tx.clone();
                    let wait = Duration::from_secs(self.settings.queue_timeout);
                    let handle = tokio::spawn(async move {
                        sleep(wait).await;
                        let _ = tx.send(Event::QueueTimeout { token });
                    });
                    self.queue_timers.insert(token, handle.abort_handle());
                    info!(
                        "all workers are busy: queueing request ({} queued)",
                        self.queue.len()
                    );
                    return;
                }
                Err(rejected) => rejected.origin,
            }
        } else {
            origin
        };
        warn!("no free workers");
        self.fail_origin(origin, b"error: No free workers\n", b"TEMP No free workers");
    }

    fn fail_origin(&mut self, origin: Origin, client_msg: &[u8], map_msg: &[u8]) {
        match origin {
            Origin::Client(r) => {
                let _ = r.send(client_msg.to_vec());
            }
            Origin::Map(r) => {
                let _ = r.send(map_msg.to_vec());
            }
            Origin::Tick(n) => {
                warn!("tick {n} skipped");
                self.schedule_tick(n);
            }
        }
    }

    /// Hand an admitted request to an idle worker and start its I/O
    /// task.
    fn begin_command(&mut self, idx: usize, line: String, kind: CommandKind, origin: Origin) {
        let now = unix_now();
        let events = self.pool.set_state(idx, WorkerState::Busy, now);
        self.broadcast_all(events);

        let tag = command::status_tag_of(&line);
        {
            let s = self.pool.slot_mut(idx);
            s.cmd = Some(kind);
            if kind.history_index().is_some() {
                s.last_cmd = Some(kind);
            }
            s.status_tag = tag.clone();
            s.qid = command::qid_of(kind, &line);
            s.workdir = if kind == CommandKind::Scan {
                command::workdir_of(&line)
            } else {
                String::new()
            };
            s.domain = if kind == CommandKind::RecipOk {
                command::domain_of(&line).unwrap_or_default()
            } else {
                String::new()
            };
        }
        self.broadcast(&notify::worker_status(idx, &tag));

        let Some(io) = self.runtime[idx].io.take() else {
            warn!("worker {idx} has no descriptors; cannot dispatch");
            self.fail_origin(
                origin,
                b"error: Unable to activate worker\n",
                b"TEMP Unable to activate worker",
            );
            self.kill_worker(idx, "worker descriptors missing");
            return;
        };

        if kind == CommandKind::Scan {
            self.stats_log(idx, "StartFilter", "");
        }

        self.runtime[idx].origin = Some(origin);
        self.runtime[idx].start_cmd = Some(Instant::now());

        let mut wire = line.into_bytes();
        wire.push(b'\n');
        let handle = tokio::spawn(worker_io::run_request(
            idx,
            io,
            wire,
            Duration::from_secs(self.settings.client_timeout),
            Duration::from_secs(self.settings.busy_timeout),
            self.tx.clone(),
        ));
        self.runtime[idx].pending = Some(handle.abort_handle());
    }

    // ----- request completion ----------------------------------------------

    fn on_request_done(&mut self, slot: usize, outcome: IoOutcome) {
        self.runtime[slot].pending = None;
        if self.pool.slot(slot).state() != WorkerState::Busy {
            // The worker was reaped or killed while the I/O task was
            // finishing; the originator was dealt with then.
            return;
        }
        let origin = self.runtime[slot].origin.take();
        let start = self.runtime[slot].start_cmd.take();
        let tick_no = match &origin {
            Some(Origin::Tick(n)) => Some(*n),
            _ => None,
        };
        let now = unix_now();
        let ms = start.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0);
        let kind = self.pool.slot(slot).cmd;

        if let IoOutcome::WriteFailed(io) = outcome {
            warn!("worker {slot}: timeout or error sending command");
            match origin {
                Some(Origin::Client(r)) => {
                    let _ = r.send(b"error: Error talking to worker process\n".to_vec());
                }
                Some(Origin::Map(r)) => {
                    let _ = r.send(b"TEMP Error talking to worker process".to_vec());
                }
                _ => {}
            }
            drop(io);
            self.kill_worker(slot, "error talking to worker process");
            if let Some(n) = tick_no {
                self.schedule_tick(n);
            }
            return;
        }

        let (reply, io, timed_out) = match outcome {
            IoOutcome::Reply(line, io) => (Some(line), io, false),
            IoOutcome::Eof(io) | IoOutcome::ReadError(io) => (None, io, false),
            IoOutcome::ReadTimeout(io) => (None, io, true),
            IoOutcome::WriteFailed(_) => unreachable!("handled above"),
        };

        match origin {
            Some(Origin::Client(r)) => match (&reply, timed_out) {
                (Some(line), _) => {
                    let _ = r.send(line.clone());
                }
                (None, true) => {
                    let msg: &[u8] = if self.pool.count(WorkerState::Busy) > 3 {
                        b"ERR Filter timed out - system may be overloaded (consider increasing busy timeout)\n"
                    } else {
                        b"ERR Filter timed out - check filter rules or system load\n"
                    };
                    let _ = r.send(msg.to_vec());
                }
                (None, false) => {
                    if self.pool.slot(slot).oom {
                        error!(
                            "worker {slot} ran out of memory; possible denial of service from overly complex input"
                        );
                    } else {
                        error!("worker {slot} died prematurely; check your filter rules");
                    }
                    let _ = r.send(b"ERR No response from worker\n".to_vec());
                }
            },
            Some(Origin::Map(r)) => match &reply {
                Some(line) => {
                    let mut text = String::from_utf8_lossy(line).into_owned();
                    while text.ends_with('\n') || text.ends_with('\r') {
                        text.pop();
                    }
                    let _ = r.send(codec::percent_decode(&text));
                }
                None => {
                    let _ = r.send(b"TEMP Busy timeout on worker".to_vec());
                }
            },
            Some(Origin::Tick(_)) | None => {}
        }

        self.pool.slot_mut(slot).num_requests += 1;
        if let Some(k) = kind.filter(|k| k.history_index().is_some()) {
            let busy = self.pool.count(WorkerState::Busy) as u64;
            self.history.record_request(k, now, busy, ms);
            if k == CommandKind::Scan {
                self.pool.slot_mut(slot).num_scans += 1;
                self.num_msgs += 1;
            }
        }

        if timed_out {
            self.broadcast(notify::EVENT_BUSY_TIMEOUT);
            drop(io);
            self.kill_worker(slot, "busy timeout");
        } else {
            self.runtime[slot].io = Some(io);
            let events = self.pool.set_state(slot, WorkerState::Idle, now);
            self.broadcast_all(events);
            {
                let s = self.pool.slot_mut(slot);
                s.cmd = None;
                s.idle_since = now;
            }
            self.after_request(slot);
        }

        if !self.pool.slot(slot).workdir.is_empty() {
            let n = self.pool.slot(slot).num_requests;
            self.stats_log(slot, "EndFilter", &format!("numRequests={n}"));
        }
        if let Some(n) = tick_no {
            self.schedule_tick(n);
        }
    }

    /// Post-completion policy: feed a queued request to the pool
    /// before considering retirement, then expire the worker if it is
    /// over any limit. A worker with queued work pending gets a grace
    /// window of triple the request limit.
    fn after_request(&mut self, slot: usize) {
        let within_grace =
            self.pool.slot(slot).num_requests < self.settings.max_requests.saturating_mul(3);
        if within_grace && self.try_dequeue() {
            return;
        }
        if let Some(reason) = self.pool.expiry_reason(slot, &self.settings, unix_now()) {
            self.kill_worker(slot, &reason);
        }
    }

    fn try_dequeue(&mut self) -> bool {
        let Some((token, req)) = self.queue.pop() else {
            return false;
        };
        if let Some(h) = self.queue_timers.remove(&token) {
            h.abort();
        }
        self.dispatch_request(req.line, req.origin, false);
        true
    }

    fn on_queue_timeout(&mut self, token: u64) {
        self.queue_timers.remove(&token);
        if let Some(req) = self.queue.remove(token) {
            info!("queued request timed out ({} still queued)", self.queue.len());
            self.fail_origin(
                req.origin,
                b"error: Queued request timed out\n",
                b"TEMP Queued request timed out",
            );
        }
    }

    // ----- activation ------------------------------------------------------

    /// Start a subprocess for a stopped slot. Fails when the
    /// inter-activation wait has not elapsed or the spawn itself
    /// fails; the caller reports to the originator.
    fn activate(&mut self, idx: usize, reason: &str) -> Result<(), ()> {
        let now = unix_now();
        if self.settings.wait_time > 0 {
            if let Some(last) = self.last_activation {
                if now.saturating_sub(last) < self.settings.wait_time {
                    debug!(
                        "did not start worker {idx}: not enough time since last activation"
                    );
                    return Err(());
                }
            }
        }

        let spawned = match worker_io::spawn_worker(&self.settings, idx, &self.tx) {
            Ok(s) => s,
            Err(e) => {
                error!("could not start worker {idx}: {e:#}");
                return Err(());
            }
        };

        let seq = self.pool.next_activation_seq();
        let generation = self.pool.generation();
        {
            let s = self.pool.slot_mut(idx);
            s.pid = Some(spawned.pid);
            s.num_requests = 0;
            s.num_scans = 0;
            s.oom = false;
            s.generation = generation;
            s.activated = seq;
            s.activation_time = Some(now);
            s.idle_since = now;
            s.first_req_time = None;
            s.last_cmd = None;
            s.qid.clear();
            s.workdir.clear();
            s.domain.clear();
        }
        let events = self.pool.set_state(idx, WorkerState::Idle, now);
        self.broadcast_all(events);
        self.runtime[idx].io = Some(spawned.io);
        self.history.record_activation(now);
        if self.settings.wait_time > 0 {
            self.last_activation = Some(now);
        }
        info!(
            "starting worker {idx} (pid {}) ({} running): {reason}",
            spawned.pid,
            self.pool.running()
        );
        self.stats_log(idx, "StartWorker", &format!("reason=\"{reason}\""));
        Ok(())
    }

    // ----- kill and reap ---------------------------------------------------

    /// Retire a worker: wake it, close its stdin so it sees EOF, and
    /// arm the escalation timer. A busy worker gets SIGTERM up front
    /// and goes straight to the SIGKILL stage.
    fn kill_worker(&mut self, slot: usize, reason: &str) {
        if self.pool.slot(slot).state() == WorkerState::Killed {
            return;
        }
        let Some(pid) = self.pool.slot(slot).pid else {
            return;
        };
        let now = unix_now();
        let state = self.pool.slot(slot).state();
        info!(
            "killing {} worker {slot} (pid {pid}) req={} age={} req_age={}: {reason}",
            state.name_lc(),
            self.pool.slot(slot).num_requests,
            self.pool.slot(slot).age(now).map_or(-1, |a| a as i64),
            self.pool
                .slot(slot)
                .request_age(now)
                .map_or(-1, |a| a as i64),
        );

        // In case, for some weird reason, the worker has stopped...
        let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
        let with_prejudice = state == WorkerState::Busy;
        if with_prejudice {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }

        let events = self.pool.set_state(slot, WorkerState::Killed, now);
        self.broadcast_all(events);

        let rt = &mut self.runtime[slot];
        rt.clear_tasks();
        rt.io = None; // stdin closes here; a well-behaved worker exits
        rt.origin = None;
        rt.start_cmd = None;

        let stage = if with_prejudice {
            KillStage::Nuke
        } else {
            KillStage::Term
        };
        self.arm_kill_timer(slot, pid, stage);
        let req = self.pool.slot(slot).num_requests;
        let age = self.pool.slot(slot).age(now).map_or(-1, |a| a as i64);
        self.stats_log(
            slot,
            "KillWorker",
            &format!("req={req} age={age} reason=\"{reason}\""),
        );
    }

    fn arm_kill_timer(&mut self, slot: usize, pid: i32, stage: KillStage) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(Duration::from_secs(KILL_ESCALATION_SECS)).await;
            let _ = tx.send(Event::KillTimerFired { slot, pid });
        });
        self.runtime[slot].kill_timer = Some(handle.abort_handle());
        self.runtime[slot].kill_stage = Some(stage);
    }

    fn on_kill_timer(&mut self, slot: usize, pid: i32) {
        self.runtime[slot].kill_timer = None;
        let stage = self.runtime[slot].kill_stage.take();
        if self.pool.slot(slot).pid != Some(pid) {
            return;
        }
        match stage {
            Some(KillStage::Term) => {
                info!("worker {slot} (pid {pid}) taking too long to exit; sending SIGTERM");
                let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                self.arm_kill_timer(slot, pid, KillStage::Nuke);
            }
            Some(KillStage::Nuke) => {
                info!("worker {slot} (pid {pid}) taking way too long to exit; sending SIGKILL");
                let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
            None => {}
        }
    }

    fn on_reaped(&mut self, slot: usize, pid: i32, status: ExitStatus, expected: bool) {
        if self.pool.slot(slot).pid != Some(pid) {
            return;
        }
        let state = self.pool.slot(slot).state();
        let description = describe_exit(status, state == WorkerState::Killed || expected);
        if state == WorkerState::Killed || expected {
            debug!("reap: worker {slot} (pid {pid}) {description}");
        } else {
            if self.pool.slot(slot).oom {
                error!(
                    "reap: worker {slot} (pid {pid}) {description} after running out of memory (worker died unexpectedly)"
                );
            } else {
                error!("reap: worker {slot} (pid {pid}) {description} (worker died unexpectedly)");
            }
            self.broadcast(notify::EVENT_UNEXPECTED_DEATH);
        }

        let rt = &mut self.runtime[slot];
        rt.clear_tasks();
        rt.io = None;
        rt.origin = None;
        rt.start_cmd = None;

        let now = unix_now();
        {
            let s = self.pool.slot_mut(slot);
            s.pid = None;
            s.activation_time = None;
            s.first_req_time = None;
            s.cmd = None;
        }
        let events = self.pool.set_state(slot, WorkerState::Stopped, now);
        self.broadcast_all(events);
        self.history.record_reap(now);
        self.stats_log(slot, "ReapWorker", "");

        if !expected && self.pool.running() < self.settings.min_workers {
            self.schedule_refill();
        }
    }

    // ----- status lines ----------------------------------------------------

    fn on_status_line(&mut self, slot: usize, pid: i32, line: &str) {
        // Updates can arrive after the worker exited; only a busy
        // worker's tag is live.
        if self.pool.slot(slot).pid != Some(pid)
            || self.pool.slot(slot).state() != WorkerState::Busy
        {
            debug!("ignoring status update for non-busy worker {slot}");
            return;
        }
        let mut tag = codec::percent_decode_lossy(line.trim_end());
        if tag.len() > MAX_STATUS_LEN {
            let mut end = MAX_STATUS_LEN;
            while end > 0 && !tag.is_char_boundary(end) {
                end -= 1;
            }
            tag.truncate(end);
        }
        self.pool.slot_mut(slot).status_tag = tag.clone();
        self.broadcast(&notify::worker_status(slot, &tag));
    }

    // ----- pool maintenance ------------------------------------------------

    /// Periodic sweep: expire over-age workers, kill the long-idle
    /// surplus, then refill to the minimum.
    fn idle_sweep(&mut self) {
        let now = unix_now();
        let mut alive = self.pool.running();

        if let Some(max) = self.settings.max_lifetime {
            for idx in self.pool.list(WorkerState::Idle) {
                if self.pool.slot(idx).request_age(now).is_some_and(|a| a > max) {
                    alive -= 1;
                    self.kill_worker(
                        idx,
                        &format!("worker has exceeded maximum lifetime of {max} seconds"),
                    );
                }
            }
        }

        for idx in self.pool.list(WorkerState::Idle) {
            if alive <= self.settings.min_workers {
                break;
            }
            if now.saturating_sub(self.pool.slot(idx).idle_since) >= self.settings.max_idle_time {
                alive -= 1;
                self.kill_worker(idx, "idle timeout");
            }
        }

        if alive < self.settings.min_workers {
            self.schedule_refill();
        }
    }

    /// Start one worker if below the minimum, then reschedule until
    /// the minimum is met; activations are slewed, never batched.
    fn bring_up_to_min(&mut self) {
        self.min_refill_scheduled = false;
        if self.pool.running() >= self.settings.min_workers {
            return;
        }
        if let Some(idx) = self.pool.list(WorkerState::Stopped).first().copied() {
            let reason = format!(
                "bringing workers up to minWorkers ({})",
                self.settings.min_workers
            );
            let _ = self.activate(idx, &reason);
        }
        if self.pool.running() < self.settings.min_workers {
            self.schedule_refill();
        }
    }

    fn schedule_refill(&mut self) {
        if self.min_refill_scheduled {
            return;
        }
        self.min_refill_scheduled = true;
        let tx = self.tx.clone();
        let slew = Duration::from_secs(self.settings.slew_time);
        tokio::spawn(async move {
            sleep(slew).await;
            let _ = tx.send(Event::BringUpToMin);
        });
    }

    // ----- ticks -----------------------------------------------------------

    fn on_tick(&mut self, tick_no: usize) {
        let Some(idx) = self.pool.find_free(CommandKind::Other) else {
            warn!("tick {tick_no} skipped: no free workers");
            self.schedule_tick(tick_no);
            return;
        };
        if self.pool.slot(idx).state() == WorkerState::Stopped
            && self.activate(idx, "about to run tick").is_err()
        {
            warn!("tick {tick_no} skipped: unable to activate worker {idx}");
            self.schedule_tick(tick_no);
            return;
        }
        self.begin_command(
            idx,
            format!("tick {tick_no}"),
            CommandKind::Other,
            Origin::Tick(tick_no),
        );
    }

    fn schedule_tick(&mut self, tick_no: usize) {
        if self.settings.tick_interval == 0 {
            return;
        }
        let tx = self.tx.clone();
        let wait = Duration::from_secs(self.settings.tick_interval);
        tokio::spawn(async move {
            sleep(wait).await;
            let _ = tx.send(Event::Tick { tick_no });
        });
    }

    // ----- generation reload -----------------------------------------------

    /// Bump the pool generation and kill everything idle; busy workers
    /// fall at their next expiry check because their generation is now
    /// stale.
    fn reload(&mut self) {
        let generation = self.pool.bump_generation();
        info!("reload: new generation {generation}");
        loop {
            let idle = self.pool.list(WorkerState::Idle);
            let Some(&idx) = idle.first() else { break };
            self.kill_worker(idx, "forcing reread of filter rules");
        }
        self.broadcast(notify::EVENT_RELOAD);
    }

    // ----- notification bus ------------------------------------------------

    fn on_notify_conn(&mut self, stream: UnixStream) {
        let Some(id) = self.listeners.iter().position(Option::is_none) else {
            notifier::reject(stream);
            return;
        };
        self.listeners[id] = Some(notifier::attach(id, stream, self.tx.clone()));
    }

    fn broadcast(&mut self, msg: &str) {
        for listener in self.listeners.iter().flatten() {
            if listener.mask.wants(msg) {
                let _ = listener.tx.send(msg.to_string());
            }
        }
    }

    fn broadcast_all(&mut self, events: Vec<String>) {
        for ev in events {
            self.broadcast(&ev);
        }
    }

    // ----- periodic status log ---------------------------------------------

    fn log_status(&mut self) {
        if self.settings.log_status_interval == 0 {
            return;
        }
        info!(
            "worker status: Stopped={} Idle={} Busy={} Killed={} Queued={} Msgs={} Activations={}",
            self.pool.count(WorkerState::Stopped),
            self.pool.count(WorkerState::Idle),
            self.pool.count(WorkerState::Busy),
            self.pool.count(WorkerState::Killed),
            self.queue.len(),
            self.num_msgs,
            self.pool.activations()
        );
    }

    fn stats_log(&mut self, slot: usize, event: &str, extra: &str) {
        let nworkers = self.pool.running();
        let nbusy = self.pool.count(WorkerState::Busy);
        self.stats.log(event, slot as i64, nworkers, nbusy, extra);
    }

    // ----- graceful shutdown -----------------------------------------------

    /// SIGTERM drain: close every worker's stdin and give them ten
    /// seconds to exit, then SIGTERM plus ten more, then SIGKILL.
    async fn shutdown(&mut self, rx: &mut UnboundedReceiver<Event>) {
        info!("received SIGTERM: stopping workers and terminating");
        for path in std::mem::take(&mut self.cleanup_paths) {
            let _ = std::fs::remove_file(&path);
        }

        for slot in 0..self.pool.len() {
            if let Some(pid) = self.pool.slot(slot).pid {
                let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                let rt = &mut self.runtime[slot];
                rt.clear_tasks();
                rt.io = None;
                rt.origin = None;
            }
        }

        for phase in [None, Some(Signal::SIGTERM)] {
            if self.live_pids().is_empty() {
                return;
            }
            if let Some(sig) = phase {
                info!("still some workers alive: sending {sig:?}");
                for pid in self.live_pids() {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                    let _ = kill(Pid::from_raw(pid), sig);
                }
            }
            let deadline = Instant::now() + Duration::from_secs(KILL_ESCALATION_SECS);
            while !self.live_pids().is_empty() {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    break;
                };
                match timeout(remaining, rx.recv()).await {
                    Ok(Some(Event::Reaped { slot, pid, status })) => {
                        self.on_reaped(slot, pid, status, true);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
        }

        if !self.live_pids().is_empty() {
            info!("still some workers alive: sending SIGKILL");
            for pid in self.live_pids() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    fn live_pids(&self) -> Vec<i32> {
        self.pool.iter().filter_map(|s| s.pid).collect()
    }
}

fn describe_exit(status: ExitStatus, expected: bool) -> String {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        return format!("exited normally with status {code}");
    }
    if let Some(sig) = status.signal() {
        if expected && (sig == nix::libc::SIGTERM || sig == nix::libc::SIGKILL) {
            return "exited due to SIGTERM/SIGKILL as expected".to_string();
        }
        return format!("exited due to signal {sig}");
    }
    "exited for unknown reason".to_string()
}

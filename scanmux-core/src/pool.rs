//! The worker pool: a fixed array of slots, four state lists, and the
//! free-worker selection policy.
//!
//! A slot is a stable identity; the subprocess behind it comes and
//! goes across Stopped/Idle transitions. All state changes funnel
//! through [`WorkerPool::set_state`], which keeps the per-state lists,
//! the busy histogram, and the free-worker notifications consistent.
//! The pool performs no I/O; the supervisor interprets the
//! notification strings and drives subprocesses.

use std::collections::VecDeque;

use crate::command::CommandKind;
use crate::notify;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Idle,
    Busy,
    Killed,
}

impl WorkerState {
    pub fn name(self) -> &'static str {
        match self {
            WorkerState::Stopped => "Stopped",
            WorkerState::Idle => "Idle",
            WorkerState::Busy => "Busy",
            WorkerState::Killed => "Killed",
        }
    }

    pub fn name_lc(self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Killed => "killed",
        }
    }

    /// One-character code used in the `status` reply.
    pub fn code(self) -> char {
        match self {
            WorkerState::Stopped => 'S',
            WorkerState::Idle => 'I',
            WorkerState::Busy => 'B',
            WorkerState::Killed => 'K',
        }
    }

    fn index(self) -> usize {
        match self {
            WorkerState::Stopped => 0,
            WorkerState::Idle => 1,
            WorkerState::Busy => 2,
            WorkerState::Killed => 3,
        }
    }
}

/// Bookkeeping for one pool slot.
///
/// Everything here is plain data; descriptors, child handles, and
/// pending-I/O abort handles live in the supervisor, keyed by the same
/// slot index.
#[derive(Debug)]
pub struct WorkerSlot {
    state: WorkerState,
    pub pid: Option<i32>,
    pub num_requests: u32,
    pub num_scans: u32,
    /// When the worker last became idle.
    pub idle_since: u64,
    /// When the current subprocess was activated.
    pub activation_time: Option<u64>,
    /// When the current subprocess served its first request.
    pub first_req_time: Option<u64>,
    pub last_state_change: u64,
    /// Activation sequence number; lower means activated earlier.
    pub activated: u64,
    /// Worker printed an out-of-memory complaint on stderr.
    pub oom: bool,
    pub qid: String,
    pub workdir: String,
    pub status_tag: String,
    /// Destination domain of the recipok currently in flight.
    pub domain: String,
    pub generation: u64,
    /// Command currently in flight.
    pub cmd: Option<CommandKind>,
    /// Last tracked command this subprocess executed; `None` means the
    /// subprocess is fresh and counts as a match for any command.
    pub last_cmd: Option<CommandKind>,
    /// Busy-histogram counter: slot `i` counts how often the pool
    /// reached `i + 1` simultaneously busy workers.
    pub histo: u32,
}

impl WorkerSlot {
    fn new(now: u64) -> Self {
        Self {
            state: WorkerState::Stopped,
            pid: None,
            num_requests: 0,
            num_scans: 0,
            idle_since: 0,
            activation_time: None,
            first_req_time: None,
            last_state_change: now,
            activated: 0,
            oom: false,
            qid: String::new(),
            workdir: String::new(),
            status_tag: String::new(),
            domain: String::new(),
            generation: 0,
            cmd: None,
            last_cmd: None,
            histo: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Seconds since activation, if activated.
    pub fn age(&self, now: u64) -> Option<u64> {
        self.activation_time.map(|t| now.saturating_sub(t))
    }

    /// Seconds since the first request, if any was served.
    pub fn request_age(&self, now: u64) -> Option<u64> {
        self.first_req_time.map(|t| now.saturating_sub(t))
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    lists: [VecDeque<usize>; 4],
    generation: u64,
    activations: u64,
    old_free: Option<usize>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, now: u64) -> Self {
        let slots = (0..max_workers).map(|_| WorkerSlot::new(now)).collect();
        let stopped: VecDeque<usize> = (0..max_workers).collect();
        Self {
            slots,
            lists: [stopped, VecDeque::new(), VecDeque::new(), VecDeque::new()],
            generation: 0,
            activations: 0,
            old_free: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> &WorkerSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut WorkerSlot {
        &mut self.slots[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter()
    }

    pub fn count(&self, state: WorkerState) -> usize {
        self.lists[state.index()].len()
    }

    /// Workers that could take a request without waiting: Idle plus
    /// Stopped (activatable).
    pub fn free_workers(&self) -> usize {
        self.count(WorkerState::Idle) + self.count(WorkerState::Stopped)
    }

    /// Workers with a live subprocess.
    pub fn running(&self) -> usize {
        self.count(WorkerState::Idle) + self.count(WorkerState::Busy) + self.count(WorkerState::Killed)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Total activations since startup.
    pub fn activations(&self) -> u64 {
        self.activations
    }

    /// Claim the next activation sequence number.
    pub fn next_activation_seq(&mut self) -> u64 {
        let seq = self.activations;
        self.activations += 1;
        seq
    }

    /// Slot indices currently on the given state list, head first.
    pub fn list(&self, state: WorkerState) -> Vec<usize> {
        self.lists[state.index()].iter().copied().collect()
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        // Most likely on the killed list, so search it first.
        for state in [WorkerState::Killed, WorkerState::Idle, WorkerState::Busy] {
            for &i in &self.lists[state.index()] {
                if self.slots[i].pid == Some(pid) {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Move a slot onto a new state list, returning the notification
    /// messages the transition produced (state change first, then any
    /// free-worker count messages), in emission order.
    pub fn set_state(&mut self, idx: usize, new: WorkerState, now: u64) -> Vec<String> {
        let mut events = Vec::new();
        self.slots[idx].status_tag.clear();
        let old = self.slots[idx].state;
        if old == new {
            return events;
        }
        events.push(notify::state_change(idx, old.name(), new.name()));

        let old_list = &mut self.lists[old.index()];
        if let Some(pos) = old_list.iter().position(|&i| i == idx) {
            old_list.remove(pos);
        }
        self.lists[new.index()].push_front(idx);
        self.slots[idx].state = new;
        self.slots[idx].last_state_change = now;

        if new == WorkerState::Busy {
            let busy = self.count(WorkerState::Busy);
            self.slots[busy - 1].histo += 1;
            if self.slots[idx].first_req_time.is_none() {
                self.slots[idx].first_req_time = Some(now);
            }
        }

        let free = self.free_workers();
        if self.old_free != Some(free) {
            events.push(notify::free_count(free));
        }
        if free == 0 {
            events.push(notify::EVENT_ZERO_FREE.to_string());
        }
        if self.old_free == Some(0) && free != 0 {
            events.push(notify::EVENT_FREE_AGAIN.to_string());
        }
        self.old_free = Some(free);
        events
    }

    /// Pick a worker for the given command: the lowest-activation Idle
    /// worker whose `last_cmd` matches (a fresh worker matches
    /// anything); failing that, the lowest-activation Idle worker;
    /// failing that, the head of the Stopped list. Deterministic for
    /// a given pool state.
    pub fn find_free(&mut self, kind: CommandKind) -> Option<usize> {
        let mut best_any: Option<usize> = None;
        let mut best_match: Option<usize> = None;
        for &i in &self.lists[WorkerState::Idle.index()] {
            let s = &self.slots[i];
            let better = |cur: Option<usize>| {
                cur.is_none_or(|b| s.activated < self.slots[b].activated)
            };
            if better(best_any) {
                best_any = Some(i);
            }
            let matches = match s.last_cmd {
                None => true,
                Some(k) => k == kind,
            };
            if matches && better(best_match) {
                best_match = Some(i);
            }
        }

        let chosen = best_match
            .or(best_any)
            .or_else(|| self.lists[WorkerState::Stopped.index()].front().copied());
        if let Some(i) = chosen {
            self.slots[i].status_tag.clear();
            self.slots[i].cmd = None;
        }
        chosen
    }

    /// Busy workers running a recipok for the given domain
    /// (case-insensitive).
    pub fn busy_recipok_for_domain(&self, domain: &str) -> usize {
        self.lists[WorkerState::Busy.index()]
            .iter()
            .filter(|&&i| {
                let s = &self.slots[i];
                s.cmd == Some(CommandKind::RecipOk) && s.domain.eq_ignore_ascii_case(domain)
            })
            .count()
    }

    /// Why this worker should be retired now, if any reason applies.
    pub fn expiry_reason(&self, idx: usize, settings: &Settings, now: u64) -> Option<String> {
        let s = &self.slots[idx];
        if s.num_requests >= settings.max_requests {
            return Some(format!("worker has processed {} requests", s.num_requests));
        }
        if let Some(max) = settings.max_lifetime {
            if s.request_age(now).is_some_and(|age| age > max) {
                return Some(format!("worker has exceeded maximum lifetime of {max} seconds"));
            }
        }
        if s.generation < self.generation {
            return Some("new generation, forcing reread of filter rules".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> WorkerPool {
        WorkerPool::new(n, 1000)
    }

    fn activate(p: &mut WorkerPool, idx: usize, now: u64) {
        let seq = p.next_activation_seq();
        let generation = p.generation();
        let s = p.slot_mut(idx);
        s.pid = Some(10_000 + idx as i32);
        s.activated = seq;
        s.activation_time = Some(now);
        s.idle_since = now;
        s.generation = generation;
        s.num_requests = 0;
        s.last_cmd = None;
        p.set_state(idx, WorkerState::Idle, now);
    }

    #[test]
    fn counts_always_sum_to_pool_size() {
        let mut p = pool(4);
        activate(&mut p, 0, 1000);
        activate(&mut p, 1, 1001);
        p.set_state(0, WorkerState::Busy, 1002);
        p.set_state(1, WorkerState::Killed, 1003);
        let total: usize = [
            WorkerState::Stopped,
            WorkerState::Idle,
            WorkerState::Busy,
            WorkerState::Killed,
        ]
        .iter()
        .map(|&s| p.count(s))
        .sum();
        assert_eq!(total, 4);
        for state in [WorkerState::Stopped, WorkerState::Idle, WorkerState::Busy] {
            for idx in p.list(state) {
                assert_eq!(p.slot(idx).state(), state);
            }
        }
    }

    #[test]
    fn cold_pool_hands_out_slot_zero_first() {
        let mut p = pool(2);
        assert_eq!(p.find_free(CommandKind::Scan), Some(0));
    }

    #[test]
    fn selection_prefers_matching_then_oldest() {
        let mut p = pool(4);
        activate(&mut p, 0, 1000);
        activate(&mut p, 1, 1001);
        activate(&mut p, 2, 1002);
        p.slot_mut(0).last_cmd = Some(CommandKind::RelayOk);
        p.slot_mut(1).last_cmd = Some(CommandKind::Scan);
        p.slot_mut(2).last_cmd = Some(CommandKind::Scan);

        // Worker 1 ran the same command and was activated before 2.
        assert_eq!(p.find_free(CommandKind::Scan), Some(1));
        // No relayok matches besides 0 itself.
        assert_eq!(p.find_free(CommandKind::RelayOk), Some(0));
        // Nothing matches senderok; fall back to the oldest idle.
        assert_eq!(p.find_free(CommandKind::SenderOk), Some(0));
    }

    #[test]
    fn fresh_workers_match_any_command() {
        let mut p = pool(4);
        activate(&mut p, 0, 1000);
        activate(&mut p, 1, 1001);
        p.slot_mut(0).last_cmd = Some(CommandKind::RelayOk);
        // Worker 1 is fresh: preferred for a scan over the relayok
        // veteran even though 0 is older.
        assert_eq!(p.find_free(CommandKind::Scan), Some(1));
    }

    #[test]
    fn selection_is_deterministic() {
        let mut p = pool(4);
        activate(&mut p, 0, 1000);
        activate(&mut p, 1, 1001);
        let a = p.find_free(CommandKind::Scan);
        let b = p.find_free(CommandKind::Scan);
        assert_eq!(a, b);
    }

    #[test]
    fn histogram_counts_peak_busy_levels() {
        let mut p = pool(4);
        for i in 0..3 {
            activate(&mut p, i, 1000);
        }
        // Drive busy count to 3 once and to 2 once.
        p.set_state(0, WorkerState::Busy, 1001);
        p.set_state(1, WorkerState::Busy, 1001);
        p.set_state(2, WorkerState::Busy, 1001);
        p.set_state(2, WorkerState::Idle, 1002);
        p.set_state(1, WorkerState::Idle, 1002);
        p.set_state(0, WorkerState::Idle, 1002);
        p.set_state(0, WorkerState::Busy, 1003);
        p.set_state(1, WorkerState::Busy, 1003);
        p.set_state(1, WorkerState::Idle, 1004);
        p.set_state(0, WorkerState::Idle, 1004);

        assert_eq!(p.slot(0).histo, 2); // reached one-busy twice
        assert_eq!(p.slot(1).histo, 2); // reached two-busy twice
        assert_eq!(p.slot(2).histo, 1); // reached three-busy once
        assert_eq!(p.slot(3).histo, 0);

        // Histogram total equals the number of transitions into Busy.
        let total: u32 = p.iter().map(|s| s.histo).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn free_worker_events_fire_in_order() {
        let mut p = pool(1);
        activate(&mut p, 0, 1000);
        let events = p.set_state(0, WorkerState::Busy, 1001);
        assert_eq!(events[0], "S 0 StateChange Idle -> Busy\n");
        assert_eq!(events[1], "F 0\n");
        assert_eq!(events[2], "Z\n");

        let events = p.set_state(0, WorkerState::Idle, 1002);
        assert_eq!(events[0], "S 0 StateChange Busy -> Idle\n");
        assert_eq!(events[1], "F 1\n");
        assert_eq!(events[2], "Y\n");
    }

    #[test]
    fn first_req_time_is_stamped_on_first_busy() {
        let mut p = pool(2);
        activate(&mut p, 0, 1000);
        assert!(p.slot(0).first_req_time.is_none());
        p.set_state(0, WorkerState::Busy, 1005);
        assert_eq!(p.slot(0).first_req_time, Some(1005));
        p.set_state(0, WorkerState::Idle, 1006);
        p.set_state(0, WorkerState::Busy, 1010);
        assert_eq!(p.slot(0).first_req_time, Some(1005));
    }

    #[test]
    fn per_domain_recipok_counting_is_case_insensitive() {
        let mut p = pool(3);
        activate(&mut p, 0, 1000);
        activate(&mut p, 1, 1000);
        p.set_state(0, WorkerState::Busy, 1001);
        p.slot_mut(0).cmd = Some(CommandKind::RecipOk);
        p.slot_mut(0).domain = "Example.COM".to_string();
        p.set_state(1, WorkerState::Busy, 1001);
        p.slot_mut(1).cmd = Some(CommandKind::Scan);
        p.slot_mut(1).domain = "example.com".to_string();

        assert_eq!(p.busy_recipok_for_domain("example.com"), 1);
        assert_eq!(p.busy_recipok_for_domain("other.com"), 0);
    }

    #[test]
    fn expiry_reasons_in_priority_order() {
        let mut p = pool(2);
        let settings = Settings {
            max_requests: 10,
            max_lifetime: Some(100),
            ..Settings::default()
        };
        activate(&mut p, 0, 1000);
        p.set_state(0, WorkerState::Busy, 1000);
        p.set_state(0, WorkerState::Idle, 1001);

        assert!(p.expiry_reason(0, &settings, 1001).is_none());

        p.slot_mut(0).num_requests = 10;
        assert!(
            p.expiry_reason(0, &settings, 1001)
                .is_some_and(|r| r.contains("10 requests"))
        );
        p.slot_mut(0).num_requests = 1;

        assert!(
            p.expiry_reason(0, &settings, 1200)
                .is_some_and(|r| r.contains("maximum lifetime"))
        );

        p.bump_generation();
        assert!(
            p.expiry_reason(0, &settings, 1001)
                .is_some_and(|r| r.contains("new generation"))
        );
    }

    #[test]
    fn find_by_pid_searches_live_lists() {
        let mut p = pool(3);
        activate(&mut p, 0, 1000);
        activate(&mut p, 1, 1000);
        p.set_state(1, WorkerState::Killed, 1001);
        assert_eq!(p.find_by_pid(10_000), Some(0));
        assert_eq!(p.find_by_pid(10_001), Some(1));
        assert_eq!(p.find_by_pid(99), None);
    }
}

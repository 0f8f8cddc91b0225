//! # scanmux-core
//!
//! Engine state for the scanmux worker-pool multiplexor: the worker
//! pool and its scheduler, the deferred-request queue, the sliding
//! load history, notification-bus bookkeeping, the wire codecs
//! (percent encoding and netstrings), and the report renderers for
//! the control protocol.
//!
//! Everything in this crate is deliberately free of sockets and
//! subprocesses. The supervisor daemon (`scanmux-server`) owns all
//! I/O and drives these types from a single task, so none of them
//! need interior locking.

pub mod codec;
pub mod command;
pub mod error;
pub mod history;
pub mod notify;
pub mod pool;
pub mod queue;
pub mod report;
pub mod settings;

pub use command::CommandKind;
pub use error::{MuxError, Result};
pub use history::History;
pub use pool::{WorkerPool, WorkerState};
pub use queue::RequestQueue;
pub use settings::Settings;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch.
///
/// The pool, history, and reports all take explicit `now` arguments so
/// they stay deterministic under test; this is the one place the real
/// clock is read.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

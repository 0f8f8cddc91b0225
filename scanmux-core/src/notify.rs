//! Notification-bus bookkeeping.
//!
//! Subscribers connect to the notify socket, receive an `*OK` banner,
//! and send lines like `?FZY` or `?*` selecting which event codes they
//! want. Events are one-line messages whose first byte is a capital
//! letter code:
//!
//! - `R` reload (generation bump)
//! - `B` busy-timeout kill
//! - `U` worker died unexpectedly
//! - `F <n>` free-worker count changed
//! - `Z` free workers hit zero
//! - `Y` free workers recovered from zero
//! - `S <slot> ...` worker status / state change
//!
//! Messages whose first byte is not a capital letter (the banner)
//! bypass filtering.

/// Listener slots available on the notify socket.
pub const MAX_LISTENERS: usize = 5;
/// Bytes of backlog a slow listener may accumulate before older
/// pending messages are dropped in favor of the latest one.
pub const MAX_PENDING: usize = 256;

pub const EVENT_RELOAD: &str = "R\n";
pub const EVENT_BUSY_TIMEOUT: &str = "B\n";
pub const EVENT_UNEXPECTED_DEATH: &str = "U\n";
pub const EVENT_ZERO_FREE: &str = "Z\n";
pub const EVENT_FREE_AGAIN: &str = "Y\n";

pub fn free_count(n: usize) -> String {
    format!("F {n}\n")
}

pub fn worker_status(slot: usize, tag: &str) -> String {
    format!("S {slot} {tag}\n")
}

pub fn state_change(slot: usize, old: &str, new: &str) -> String {
    format!("S {slot} StateChange {old} -> {new}\n")
}

/// Which of the 26 event codes a listener has asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionMask(u32);

impl SubscriptionMask {
    pub const NONE: SubscriptionMask = SubscriptionMask(0);
    pub const ALL: SubscriptionMask = SubscriptionMask((1 << 26) - 1);

    /// Parse the payload of a `?` subscription line: capital letters
    /// set individual codes, `*` sets everything. Unknown characters
    /// are ignored. The previous mask is discarded.
    pub fn from_request(payload: &str) -> SubscriptionMask {
        let mut bits = 0u32;
        for c in payload.chars() {
            match c {
                'A'..='Z' => bits |= 1 << (c as u32 - 'A' as u32),
                '*' => bits = Self::ALL.0,
                _ => {}
            }
        }
        SubscriptionMask(bits)
    }

    /// Does this listener want the given message? Messages that do not
    /// start with a capital letter are always delivered.
    pub fn wants(&self, msg: &str) -> bool {
        match msg.bytes().next() {
            Some(b @ b'A'..=b'Z') => self.0 & (1 << (b - b'A') as u32) != 0,
            _ => true,
        }
    }
}

/// Fold a new message into a listener's pending buffer while a write
/// is in flight: append while the backlog fits, otherwise keep only
/// the newest message (if it fits by itself).
pub fn fold_pending(pending: &mut String, msg: &str) {
    if pending.len() + msg.len() <= MAX_PENDING {
        pending.push_str(msg);
    } else if msg.len() <= MAX_PENDING {
        pending.clear();
        pending.push_str(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_selects_individual_codes() {
        let m = SubscriptionMask::from_request("FZY");
        assert!(m.wants("F 3\n"));
        assert!(m.wants("Z\n"));
        assert!(m.wants("Y\n"));
        assert!(!m.wants("R\n"));
        assert!(!m.wants(worker_status(0, "scan Q1").as_str()));
    }

    #[test]
    fn star_selects_everything() {
        let m = SubscriptionMask::from_request("*");
        for code in 'A'..='Z' {
            assert!(m.wants(&format!("{code}\n")));
        }
    }

    #[test]
    fn banner_bypasses_filtering() {
        assert!(SubscriptionMask::NONE.wants("*OK\n"));
    }

    #[test]
    fn resubscription_replaces_mask() {
        let m = SubscriptionMask::from_request("R");
        assert!(m.wants("R\n"));
        let m = SubscriptionMask::from_request("B");
        assert!(!m.wants("R\n"));
        assert!(m.wants("B\n"));
    }

    #[test]
    fn pending_appends_then_degrades_to_latest() {
        let mut pending = String::new();
        fold_pending(&mut pending, "F 1\n");
        fold_pending(&mut pending, "Z\n");
        assert_eq!(pending, "F 1\nZ\n");

        let big = "S 0 ".to_string() + &"x".repeat(MAX_PENDING - 10) + "\n";
        fold_pending(&mut pending, &big);
        assert_eq!(pending, big);

        let oversize = "x".repeat(MAX_PENDING + 1);
        fold_pending(&mut pending, &oversize);
        assert_eq!(pending, big);
    }
}

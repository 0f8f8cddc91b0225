//! Wire-command classification.
//!
//! Requests arriving on the command sockets are single
//! newline-terminated lines whose first token is the verb. Four verbs
//! carry load history (`scan`, `relayok`, `senderok`, `recipok`);
//! everything else a worker can execute is lumped under `Other`.

use crate::codec::percent_decode_lossy;

/// Longest command line accepted from a client, including the newline.
pub const MAX_CMD_LEN: usize = 4096;
/// Longest queue-id we keep for log correlation.
pub const MAX_QID_LEN: usize = 31;
/// Longest working directory kept from a scan command.
pub const MAX_DIR_LEN: usize = 511;
/// Longest worker status tag.
pub const MAX_STATUS_LEN: usize = 63;
/// Longest domain tracked for per-domain recipok limiting.
pub const MAX_DOMAIN_LEN: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Scan,
    RelayOk,
    SenderOk,
    RecipOk,
    Other,
}

impl CommandKind {
    /// The four kinds that carry load history, in history-ring order.
    pub const TRACKED: [CommandKind; 4] = [
        CommandKind::Scan,
        CommandKind::RelayOk,
        CommandKind::SenderOk,
        CommandKind::RecipOk,
    ];

    /// Classify a command line by its verb.
    pub fn parse(line: &str) -> CommandKind {
        if line.starts_with("relayok ") {
            CommandKind::RelayOk
        } else if line.starts_with("senderok ") {
            CommandKind::SenderOk
        } else if line.starts_with("recipok ") {
            CommandKind::RecipOk
        } else if line.starts_with("scan ") {
            CommandKind::Scan
        } else {
            CommandKind::Other
        }
    }

    /// Ring index for history bookkeeping; `Other` is not tracked.
    pub fn history_index(self) -> Option<usize> {
        match self {
            CommandKind::Scan => Some(0),
            CommandKind::RelayOk => Some(1),
            CommandKind::SenderOk => Some(2),
            CommandKind::RecipOk => Some(3),
            CommandKind::Other => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Scan => "scan",
            CommandKind::RelayOk => "relayok",
            CommandKind::SenderOk => "senderok",
            CommandKind::RecipOk => "recipok",
            CommandKind::Other => "other",
        }
    }
}

fn nth_token(line: &str, n: usize) -> Option<&str> {
    line.split_ascii_whitespace().nth(n)
}

fn clamp(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        // Clamp on a character boundary; these fields are ASCII on the
        // wire but a malicious client may send anything.
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/// Extract the queue-id used for log correlation.
///
/// The qid sits at a verb-specific position:
/// `scan <qid> <dir>`, `senderok <sender> <ip> <name> <helo> <dir> <qid>`,
/// `recipok <recip> <sender> <ip> <name> <first> <helo> <dir> <qid>`.
/// Other verbs carry no qid.
pub fn qid_of(kind: CommandKind, line: &str) -> String {
    let field = match kind {
        CommandKind::Scan => 1,
        CommandKind::SenderOk => 6,
        CommandKind::RecipOk => 8,
        _ => return String::new(),
    };
    nth_token(line, field)
        .map(|t| clamp(t, MAX_QID_LEN))
        .unwrap_or_default()
}

/// Extract the working directory from a `scan` command.
pub fn workdir_of(line: &str) -> String {
    nth_token(line, 2)
        .map(|t| clamp(t, MAX_DIR_LEN))
        .unwrap_or_default()
}

/// Extract the destination domain of a recipok command: the text after
/// the first `@`, up to `>`, space, or end of line.
pub fn domain_of(line: &str) -> Option<String> {
    let at = line.find('@')?;
    let rest = &line[at + 1..];
    let end = rest
        .find(|c| c == '>' || c == ' ')
        .unwrap_or(rest.len());
    Some(clamp(&rest[..end], MAX_DOMAIN_LEN))
}

/// Derive a human-readable status tag from a command about to be sent
/// to a worker: the verb plus its first argument, percent-decoded,
/// with non-printable bytes blanked.
pub fn status_tag_of(line: &str) -> String {
    let mut out = String::new();
    let mut spaces = 0;
    for c in line.chars() {
        if c == '\n' || out.len() >= MAX_STATUS_LEN {
            break;
        }
        if c == ' ' {
            spaces += 1;
            if spaces == 2 {
                break;
            }
        }
        out.push(c);
    }
    let decoded = percent_decode_lossy(&out);
    decoded
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_verb() {
        assert_eq!(CommandKind::parse("scan Q1 /tmp/w1"), CommandKind::Scan);
        assert_eq!(
            CommandKind::parse("relayok 1.2.3.4 host"),
            CommandKind::RelayOk
        );
        assert_eq!(
            CommandKind::parse("senderok a b c d e f"),
            CommandKind::SenderOk
        );
        assert_eq!(
            CommandKind::parse("recipok a b c d e f g h"),
            CommandKind::RecipOk
        );
        assert_eq!(CommandKind::parse("tick 0"), CommandKind::Other);
        // No trailing argument means no verb match.
        assert_eq!(CommandKind::parse("scan"), CommandKind::Other);
    }

    #[test]
    fn qid_positions() {
        assert_eq!(qid_of(CommandKind::Scan, "scan QID123 /var/spool/x"), "QID123");
        assert_eq!(
            qid_of(
                CommandKind::SenderOk,
                "senderok s%40x.com 1.2.3.4 mail helo /dir QIDS"
            ),
            "QIDS"
        );
        assert_eq!(
            qid_of(
                CommandKind::RecipOk,
                "recipok r%40y.com s%40x.com 1.2.3.4 mail first helo /dir QIDR extra"
            ),
            "QIDR"
        );
        assert_eq!(qid_of(CommandKind::RelayOk, "relayok 1.2.3.4 host"), "");
    }

    #[test]
    fn qid_is_clamped() {
        let long = "Q".repeat(100);
        let cmd = format!("scan {long} /dir");
        assert_eq!(qid_of(CommandKind::Scan, &cmd).len(), MAX_QID_LEN);
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(
            domain_of("recipok <user@Example.COM> rest"),
            Some("Example.COM".to_string())
        );
        assert_eq!(
            domain_of("recipok user@example.com more"),
            Some("example.com".to_string())
        );
        assert_eq!(domain_of("recipok nodomainhere rest"), None);
    }

    #[test]
    fn status_tag_keeps_verb_and_first_arg() {
        assert_eq!(status_tag_of("scan Q1 /tmp/w1\n"), "scan Q1");
        assert_eq!(status_tag_of("tick 3\n"), "tick 3");
    }

    #[test]
    fn status_tag_decodes_and_sanitizes() {
        // %0A decodes to a newline, which is blanked to a space.
        assert_eq!(status_tag_of("scan a%0Ab rest"), "scan a b");
    }
}

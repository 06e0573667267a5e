// Line-oriented sysctl.conf editing

//! Idempotent `sysctl.conf` updates
//!
//! A setting is persisted by replacing the first line that assigns its key
//! (commented-out lines excluded) or appending a new line when none does.
//! Re-applying the same setting is a no-op.

/// IPv4 packet forwarding
pub const IPV4_FORWARDING: &str = "net.inet.ip.forwarding";

/// IPv6 packet forwarding
pub const IPV6_FORWARDING: &str = "net.inet6.ip6.forwarding";

/// `key=value` assignment line
pub fn setting_line(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

fn assigns(line: &str, key: &str) -> bool {
    line.trim_start()
        .strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

/// Replace the line assigning `key` with `line`, or append it
///
/// Returns the new contents and whether anything changed.
pub fn upsert_line(contents: &str, key: &str, line: &str) -> (String, bool) {
    let mut lines: Vec<&str> = contents.lines().collect();

    let changed = match lines.iter().position(|l| assigns(l, key)) {
        Some(idx) if lines[idx] == line => false,
        Some(idx) => {
            lines[idx] = line;
            true
        }
        None => {
            lines.push(line);
            true
        }
    };

    let mut out = lines.join("\n");
    out.push('\n');
    (out, changed)
}

use serde::{Deserialize, Serialize};

/// Prefixes users may put in front of platform ids in allowlists and
/// outbound targets (`dingtalk:0123`, `dd:0123`).
const CHANNEL_PREFIXES: &[&str] = &["dingtalk:", "ding:", "dd:"];

/// Strip a leading channel prefix (case-insensitive) from a peer id.
pub fn strip_channel_prefix(id: &str) -> &str {
    let trimmed = id.trim();
    for prefix in CHANNEL_PREFIXES {
        if trimmed.len() >= prefix.len()
            && trimmed.is_char_boundary(prefix.len())
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            return trimmed[prefix.len()..].trim();
        }
    }
    trimmed
}

/// Check if a peer appears in an allowlist.
///
/// An empty allowlist matches nobody; callers that want "empty means open"
/// must check that themselves. Entries and the peer id are compared after
/// stripping channel prefixes, case-insensitively, with glob-style `*`
/// wildcards (a lone `*` matches everyone).
pub fn is_allowed(peer_id: &str, allowlist: &[String]) -> bool {
    let peer_lower = strip_channel_prefix(peer_id).to_lowercase();
    if peer_lower.is_empty() {
        return false;
    }
    allowlist.iter().any(|entry| {
        let pat = strip_channel_prefix(entry).to_lowercase();
        if pat.contains('*') {
            glob_match(&pat, &peer_lower)
        } else {
            pat == peer_lower
        }
    })
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment must match at start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment must match at end (unless pattern ends with *)
    if !parts.last().unwrap_or(&"").is_empty() {
        pos == text.len()
    } else {
        true
    }
}

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    #[default]
    Open,
    /// Only senders on the allowlist.
    Allowlist,
    /// The host runtime decides (pairing codes, approvals).
    Pairing,
    /// DMs disabled.
    Disabled,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot responds in all groups.
    #[default]
    Open,
    /// Only in groups on the allowlist.
    Allowlist,
    /// Groups disabled.
    Disabled,
}

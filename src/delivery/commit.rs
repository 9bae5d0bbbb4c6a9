//! Commit extraction from captured agent output.
//!
//! The agent is asked to print an explicit `NUDGE_COMMIT: <hash>` marker,
//! but not every agent run does. Fallbacks match the `[branch abc1234]`
//! line git prints on commit, then any plausible bare hash. If the log
//! also mentions a recognizable GitHub/GitLab remote, a browsable commit
//! URL is derived.

use regex::Regex;
use std::sync::OnceLock;

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"NUDGE_COMMIT:\s*([0-9a-f]{7,40})").unwrap())
}

fn git_output_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[\w./-]+\s+([0-9a-f]{7,40})\]").unwrap())
}

fn bare_hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:commit\s+)([0-9a-f]{7,40})\b").unwrap())
}

fn remote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:https://|git@)(github\.com|gitlab\.com)[:/]([\w.-]+/[\w.-]+?)(?:\.git)?(?:[\s/]|$)")
            .unwrap()
    })
}

/// Find the commit hash the agent produced, if any. The explicit marker
/// wins over pattern-matched fallbacks.
pub fn extract_commit(log: &str) -> Option<String> {
    if let Some(caps) = marker_re().captures(log) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = git_output_re().captures(log) {
        return Some(caps[1].to_string());
    }
    bare_hash_re()
        .captures(log)
        .map(|caps| caps[1].to_string())
}

/// Derive a browsable commit URL when the log mentions a known remote.
pub fn derive_commit_url(log: &str, commit: &str) -> Option<String> {
    let caps = remote_re().captures(log)?;
    let host = &caps[1];
    let repo = caps[2].trim_end_matches(".git");
    match host {
        "github.com" => Some(format!("https://github.com/{repo}/commit/{commit}")),
        "gitlab.com" => Some(format!("https://gitlab.com/{repo}/-/commit/{commit}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_marker_wins() {
        let log = "did stuff\n[main deadbee] msg\nNUDGE_COMMIT: abc1234\n";
        assert_eq!(extract_commit(log).as_deref(), Some("abc1234"));
    }

    #[test]
    fn git_commit_output_line_is_matched() {
        let log = "[feature/blue-button 4f2a91c] make button blue\n 1 file changed";
        assert_eq!(extract_commit(log).as_deref(), Some("4f2a91c"));
    }

    #[test]
    fn bare_hash_needs_commit_keyword() {
        let log = "commit 0123456789abcdef0123456789abcdef01234567 (HEAD -> main)";
        assert_eq!(
            extract_commit(log).as_deref(),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
        // A stray hex string without context is not a commit
        assert_eq!(extract_commit("cache key deadbeefcafe1234"), None);
    }

    #[test]
    fn no_commit_in_log() {
        assert_eq!(extract_commit("edited two files, no commit made"), None);
    }

    #[test]
    fn github_https_remote_yields_url() {
        let log = "pushed to https://github.com/acme/storefront.git\n";
        assert_eq!(
            derive_commit_url(log, "abc1234").as_deref(),
            Some("https://github.com/acme/storefront/commit/abc1234")
        );
    }

    #[test]
    fn github_ssh_remote_yields_url() {
        let log = "origin  git@github.com:acme/storefront.git (push)\n";
        assert_eq!(
            derive_commit_url(log, "abc1234").as_deref(),
            Some("https://github.com/acme/storefront/commit/abc1234")
        );
    }

    #[test]
    fn gitlab_remote_uses_dash_commit_path() {
        let log = "remote https://gitlab.com/acme/storefront\n";
        assert_eq!(
            derive_commit_url(log, "abc1234").as_deref(),
            Some("https://gitlab.com/acme/storefront/-/commit/abc1234")
        );
    }

    #[test]
    fn unknown_remote_yields_no_url() {
        assert_eq!(derive_commit_url("pushed somewhere else", "abc1234"), None);
    }
}

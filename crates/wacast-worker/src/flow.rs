//! Flow engine for send-message jobs.
//!
//! Pure helpers for the two decisions a flow step needs: does an inbound
//! reply satisfy an open wait, and may a failed send try again. The
//! retry budget here is a fixed count, deliberately independent of the
//! window-bounded retry used by status broadcasts.

use wacast_core::types::{ReplyMode, WaitingReply};

/// Canonical form used on both sides of reply matching.
pub fn normalize_reply_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Whether an inbound text satisfies an open wait. Empty incoming text
/// never matches, regardless of mode.
pub fn matches_wait_reply(incoming: &str, wait: &WaitingReply) -> bool {
    let incoming = normalize_reply_text(incoming);
    if incoming.is_empty() {
        return false;
    }
    match wait.mode {
        ReplyMode::Any => true,
        ReplyMode::Exact => match wait.expected_text.as_deref() {
            Some(expected) => {
                let expected = normalize_reply_text(expected);
                !expected.is_empty() && incoming == expected
            }
            None => false,
        },
    }
}

/// Outcome of a failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub can_continue: bool,
    pub new_retry_count: u32,
    pub next_retry_at_ms: Option<i64>,
}

/// Bump the retry count and decide whether another attempt is allowed.
/// `can_continue == false` once the count reaches `max_attempts`; the
/// caller then fails the job terminally.
pub fn compute_retry_decision(
    retry_count: u32,
    now_ms: i64,
    retry_interval_ms: i64,
    max_attempts: u32,
) -> RetryDecision {
    let new_retry_count = retry_count + 1;
    if new_retry_count >= max_attempts {
        RetryDecision {
            can_continue: false,
            new_retry_count,
            next_retry_at_ms: None,
        }
    } else {
        RetryDecision {
            can_continue: true,
            new_retry_count,
            next_retry_at_ms: Some(now_ms + retry_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait(mode: ReplyMode, expected: Option<&str>) -> WaitingReply {
        WaitingReply {
            mode,
            expected_text: expected.map(str::to_string),
            started_at_ms: 0,
            timeout_at_ms: 1,
            block_index: 0,
        }
    }

    #[test]
    fn test_any_matches_non_empty_only() {
        let w = wait(ReplyMode::Any, None);
        assert!(matches_wait_reply("yes", &w));
        assert!(matches_wait_reply("  ok  ", &w));
        assert!(!matches_wait_reply("", &w));
        assert!(!matches_wait_reply("   ", &w));
    }

    #[test]
    fn test_exact_matches_trimmed_lowercased() {
        let w = wait(ReplyMode::Exact, Some("  Yes Please "));
        assert!(matches_wait_reply("yes please", &w));
        assert!(matches_wait_reply("  YES PLEASE  ", &w));
        assert!(!matches_wait_reply("yes", &w));
        assert!(!matches_wait_reply("", &w));
    }

    #[test]
    fn test_exact_without_expected_never_matches() {
        assert!(!matches_wait_reply("anything", &wait(ReplyMode::Exact, None)));
        assert!(!matches_wait_reply("anything", &wait(ReplyMode::Exact, Some("  "))));
    }

    #[test]
    fn test_retry_sequence_runs_to_exhaustion() {
        let max = 3;
        let mut count = 0;

        let d1 = compute_retry_decision(count, 1_000, 15_000, max);
        assert!(d1.can_continue);
        assert_eq!(d1.new_retry_count, 1);
        assert_eq!(d1.next_retry_at_ms, Some(16_000));
        count = d1.new_retry_count;

        let d2 = compute_retry_decision(count, 20_000, 15_000, max);
        assert!(d2.can_continue);
        assert_eq!(d2.new_retry_count, 2);
        count = d2.new_retry_count;

        let d3 = compute_retry_decision(count, 40_000, 15_000, max);
        assert!(!d3.can_continue);
        assert_eq!(d3.new_retry_count, max);
        assert_eq!(d3.next_retry_at_ms, None);
    }
}

//! Phase engine for status-broadcast jobs.
//!
//! Pure time arithmetic: given a job's fixed delivery windows and the
//! current time, decide which phase it is in and when the next in-window
//! retry may run. Window ends are inclusive.

use wacast_core::types::DeliveryWindow;

/// Where a status-broadcast job sits relative to its delivery windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotYet,
    Window1,
    Cooldown,
    Window2,
    Expired,
}

/// Partition time into exactly one phase. Boundaries: a window's end
/// timestamp is still inside the window; one millisecond past it is not.
pub fn determine_phase(window: &DeliveryWindow, now_ms: i64) -> Phase {
    if now_ms < window.window1_start_ms {
        Phase::NotYet
    } else if now_ms <= window.window1_end_ms {
        Phase::Window1
    } else if now_ms < window.window2_start_ms {
        Phase::Cooldown
    } else if now_ms <= window.window2_end_ms {
        Phase::Window2
    } else {
        Phase::Expired
    }
}

/// End of the window we are currently inside, if any.
pub fn active_window_end(window: &DeliveryWindow, now_ms: i64) -> Option<i64> {
    match determine_phase(window, now_ms) {
        Phase::Window1 => Some(window.window1_end_ms),
        Phase::Window2 => Some(window.window2_end_ms),
        _ => None,
    }
}

/// Next retry time inside the current window, or `None` when no further
/// retry fits before `window_end_ms` (the job then waits for the next
/// window or expires).
pub fn compute_next_retry(now_ms: i64, window_end_ms: i64, retry_interval_ms: i64) -> Option<i64> {
    let candidate = now_ms + retry_interval_ms;
    if candidate > window_end_ms {
        None
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> DeliveryWindow {
        DeliveryWindow {
            window1_start_ms: 1_000,
            window1_end_ms: 2_000,
            window2_start_ms: 3_000,
            window2_end_ms: 4_000,
        }
    }

    #[test]
    fn test_phase_partition_with_boundaries() {
        let w = window();
        assert_eq!(determine_phase(&w, 999), Phase::NotYet);
        assert_eq!(determine_phase(&w, 1_000), Phase::Window1);
        assert_eq!(determine_phase(&w, 2_000), Phase::Window1);
        assert_eq!(determine_phase(&w, 2_001), Phase::Cooldown);
        assert_eq!(determine_phase(&w, 2_999), Phase::Cooldown);
        assert_eq!(determine_phase(&w, 3_000), Phase::Window2);
        assert_eq!(determine_phase(&w, 4_000), Phase::Window2);
        assert_eq!(determine_phase(&w, 4_001), Phase::Expired);
    }

    #[test]
    fn test_every_instant_has_exactly_one_phase() {
        let w = window();
        let mut counts = [0usize; 5];
        for t in 0..5_000 {
            let slot = match determine_phase(&w, t) {
                Phase::NotYet => 0,
                Phase::Window1 => 1,
                Phase::Cooldown => 2,
                Phase::Window2 => 3,
                Phase::Expired => 4,
            };
            counts[slot] += 1;
        }
        // Contiguous, gap-free partition of [0, 5000): 0..1000,
        // 1000..=2000, 2001..=2999, 3000..=4000, 4001..=4999.
        assert_eq!(counts, [1_000, 1_001, 999, 1_001, 999]);
    }

    #[test]
    fn test_active_window_end() {
        let w = window();
        assert_eq!(active_window_end(&w, 500), None);
        assert_eq!(active_window_end(&w, 1_500), Some(2_000));
        assert_eq!(active_window_end(&w, 2_500), None);
        assert_eq!(active_window_end(&w, 3_500), Some(4_000));
        assert_eq!(active_window_end(&w, 9_000), None);
    }

    #[test]
    fn test_next_retry_bounded_by_window_end() {
        assert_eq!(compute_next_retry(100, 1_000, 500), Some(600));
        assert_eq!(compute_next_retry(500, 1_000, 500), Some(1_000));
        assert_eq!(compute_next_retry(501, 1_000, 500), None);
        assert_eq!(compute_next_retry(2_000, 1_000, 500), None);
    }
}

//! Wall-clock helpers and delivery-window construction.

use crate::types::DeliveryWindow;

const TWO_MINUTES_MS: i64 = 2 * 60 * 1000;
const TEN_MINUTES_MS: i64 = 10 * 60 * 1000;

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build both delivery windows from the target time: a 2-minute first
/// window, a 10-minute cooldown, then a 2-minute second window.
pub fn build_delivery_window(target_ms: i64) -> DeliveryWindow {
    let window1_start_ms = target_ms;
    let window1_end_ms = target_ms + TWO_MINUTES_MS;
    let window2_start_ms = window1_end_ms + TEN_MINUTES_MS;
    let window2_end_ms = window2_start_ms + TWO_MINUTES_MS;

    DeliveryWindow {
        window1_start_ms,
        window1_end_ms,
        window2_start_ms,
        window2_end_ms,
    }
}

/// Local-time display used in job listings and logs.
pub fn format_local(ms: i64) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => ms.to_string(),
    }
}

//! Time utilities: an injectable clock, duration formatting, and age checks.
//!
//! Every comparison the engines make against "now" goes through a `Clock`
//! so tests can advance time deterministically instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};

/// A source of the current time, expressed as milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real wall clock, backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock whose value is set explicitly, for deterministic tests of
/// time-driven transitions (idle/unreachable/offline thresholds).
#[derive(Debug)]
pub struct MockClock {
    millis: AtomicI64,
}

impl MockClock {
    pub fn new(start_ms: i64) -> Self {
        Self { millis: AtomicI64::new(start_ms) }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A timestamp is sane if it is strictly positive and not more than
/// `max_future_skew_ms` ahead of `now_ms` (B2: anything else is treated as
/// missing and substituted with the caller's current time).
pub fn is_sane_timestamp(ts_ms: i64, now_ms: i64, max_future_skew_ms: i64) -> bool {
    ts_ms > 0 && ts_ms <= now_ms.saturating_add(max_future_skew_ms)
}

/// True when `last_ms` is strictly older than `threshold_ms` relative to `now_ms`.
pub fn older_than(last_ms: i64, now_ms: i64, threshold_ms: i64) -> bool {
    now_ms.saturating_sub(last_ms) > threshold_ms
}

/// Formats a millisecond duration as a compact human-readable string, e.g.
/// `1h5m` or `450ms`. Used for log lines, never for wire data.
pub fn format_duration_ms(ms: i64) -> String {
    if ms < 0 {
        return format!("-{}", format_duration_ms(-ms));
    }
    if ms < 1000 {
        return format!("{ms}ms");
    }
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&format!("{seconds}s"));
    out
}

/// Parses a compact duration string of the form `1h5m30s`, `90s`, `250ms`
/// into milliseconds. Returns `None` on malformed input.
pub fn parse_duration_ms(input: &str) -> Option<i64> {
    let input = input.trim();
    if let Some(ms) = input.strip_suffix("ms") {
        return ms.parse::<i64>().ok();
    }

    let mut total_ms: i64 = 0;
    let mut number = String::new();
    let mut saw_unit = false;
    for ch in input.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let value: i64 = number.parse().ok()?;
        number.clear();
        let unit_ms = match ch {
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            _ => return None,
        };
        total_ms += value * unit_ms;
        saw_unit = true;
    }
    if !number.is_empty() || !saw_unit {
        return None;
    }
    Some(total_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let clock = MockClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn sane_timestamp_boundaries() {
        assert!(is_sane_timestamp(1, 1, 60_000));
        assert!(!is_sane_timestamp(0, 1, 60_000));
        assert!(!is_sane_timestamp(-5, 1, 60_000));
        assert!(is_sane_timestamp(61_000, 0, 60_000));
        assert!(!is_sane_timestamp(61_001, 0, 60_000));
    }

    #[test]
    fn older_than_is_strict() {
        assert!(!older_than(1000, 1300, 300));
        assert!(older_than(1000, 1301, 300));
    }

    #[test]
    fn duration_roundtrip() {
        assert_eq!(format_duration_ms(450), "450ms");
        assert_eq!(format_duration_ms(65_000), "1m5s");
        assert_eq!(format_duration_ms(3_661_000), "1h1m1s");
        assert_eq!(parse_duration_ms("1h1m1s"), Some(3_661_000));
        assert_eq!(parse_duration_ms("90s"), Some(90_000));
        assert_eq!(parse_duration_ms("250ms"), Some(250));
        assert_eq!(parse_duration_ms("bogus"), None);
    }
}

//! Splits a trailing day range into windows the report APIs accept.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Keeps the newest window end safely behind the server clock.
pub const CLOCK_SKEW_MINUTES: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    #[allow(dead_code)]
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn start_iso(&self) -> String {
        self.start.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    pub fn end_iso(&self) -> String {
        self.end.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// Inclusive calendar dates for APIs that take whole days. Adjacent windows
    /// map to adjacent, non-overlapping date ranges.
    pub fn inclusive_dates(&self) -> (NaiveDate, NaiveDate) {
        let end = self.end.date_naive();
        let start = self
            .start
            .date_naive()
            .succ_opt()
            .unwrap_or(end)
            .min(end);
        (start, end)
    }
}

/// Walks backward from `now - CLOCK_SKEW_MINUTES`, most recent window first.
pub fn segment(total_days: u32, max_segment_days: u32, now: DateTime<Utc>) -> Vec<DateWindow> {
    let max_segment_days = max_segment_days.max(1);
    let mut windows = Vec::new();
    let mut end = now - Duration::minutes(CLOCK_SKEW_MINUTES);
    let mut remaining = total_days;
    while remaining > 0 {
        let length = remaining.min(max_segment_days);
        let start = end - Duration::days(i64::from(length));
        windows.push(DateWindow { start, end });
        end = start;
        remaining -= length;
    }
    windows
}

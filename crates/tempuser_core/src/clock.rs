use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Datelike, TimeZone, Utc};

pub trait Clock: Send + Sync + Debug {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> i64;

    /// Current UTC calendar year.
    fn year(&self) -> i32 {
        Utc.timestamp_opt(self.now_secs(), 0)
            .single()
            .map(|dt| dt.year())
            .unwrap_or(1970)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and deterministic tooling.
#[derive(Debug)]
pub struct FixedClock {
    secs: AtomicI64,
}

impl FixedClock {
    pub fn new(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        // 2024-01-01 00:00:00 UTC
        Self::new(1_704_067_200)
    }
}

impl Clock for FixedClock {
    fn now_secs(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FixedClock};

    #[test]
    fn fixed_clock_reports_year_and_advances() {
        let clock = FixedClock::default();
        assert_eq!(clock.year(), 2024);
        clock.advance(366 * 24 * 3600);
        assert_eq!(clock.year(), 2025);
        clock.set(0);
        assert_eq!(clock.now_secs(), 0);
        assert_eq!(clock.year(), 1970);
    }
}

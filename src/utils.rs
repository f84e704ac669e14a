use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of every counting window, shared by all tiers.
pub const WINDOW_SECONDS: i64 = 60;

/// Minimum spacing between two opportunistic sweeps of the counter store.
pub const SWEEP_INTERVAL_SECONDS: i64 = 300;

/// Source of wall-clock time for window calculations
pub trait TimeSource: Send + Sync {
    /// Get the current Unix timestamp in seconds
    fn unix_now(&self) -> i64;

    /// Get the current time as a DateTime<Utc>
    fn utc_now(&self) -> DateTime<Utc> {
        to_utc(self.unix_now())
    }
}

/// Time source backed by the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn unix_now(&self) -> i64 {
        // A clock set before 1970 collapses onto the epoch window.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven time source.
///
/// Clones share the same instant, so a test can hold one handle while the
/// store and controller hold others.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicI64>,
}

impl ManualTimeSource {
    pub fn new(unix_now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(unix_now)),
        }
    }

    pub fn set(&self, unix_now: i64) {
        self.now.store(unix_now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn unix_now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Start of the window containing `now`, always a multiple of [`WINDOW_SECONDS`].
pub fn window_start(now: i64) -> i64 {
    now.div_euclid(WINDOW_SECONDS) * WINDOW_SECONDS
}

/// Unix timestamp of the next window boundary, strictly greater than `now`.
pub fn calculate_reset(now: i64) -> i64 {
    window_start(now) + WINDOW_SECONDS
}

/// Seconds a rejected client should wait before the window rolls over.
pub fn retry_after(now: i64) -> u64 {
    (calculate_reset(now) - now) as u64
}

/// Convert Unix seconds to a UTC timestamp
pub fn to_utc(unix_seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(unix_seconds, 0).unwrap_or_default()
}

/// ISO-8601 rendering used in rejection bodies, e.g. `2024-05-01T12:01:00+00:00`.
pub fn format_iso8601(unix_seconds: i64) -> String {
    to_utc(unix_seconds).to_rfc3339_opts(SecondsFormat::Secs, false)
}

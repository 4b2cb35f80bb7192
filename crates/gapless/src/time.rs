use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time, in milliseconds since the Unix epoch.
///
/// Audit timestamps, gap release times and heartbeats are all read from a
/// `TimeSource`, so tests can pin time to fixed values.
pub trait TimeSource: Send + Sync + 'static {
    /// Returns the current time in milliseconds since 1970-01-01 UTC.
    fn current_millis(&self) -> u64;
}

/// [`TimeSource`] backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

impl<T: TimeSource> TimeSource for std::sync::Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

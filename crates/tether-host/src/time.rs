use std::time::Instant;

/// Abstraction over a time source to improve testability.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time instant.
    fn now(&self) -> Instant;
}

/// System clock using `Instant::now()`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Wrapping millisecond service time of `now` relative to `start`.
///
/// Starts at 1; peers treat a zero timestamp as "never".
pub fn service_time(start: Instant, now: Instant) -> u32 {
    (now.saturating_duration_since(start).as_millis() as u32).wrapping_add(1)
}

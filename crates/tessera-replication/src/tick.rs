//! Fixed-step replication cadence.

use std::time::Duration;

/// Ticks a caller may run in one catch-up burst before the backlog is dropped.
pub const MAX_CATCH_UP_TICKS: u32 = 8;

/// Fixed-rate tick scheduler for a manager's simulation loop.
///
/// Accumulates real elapsed time and yields whole ticks. When the loop falls
/// far behind, at most [`MAX_CATCH_UP_TICKS`] are returned and the rest of
/// the backlog is discarded, so a stall does not turn into a burst of
/// back-to-back flushes.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    accumulator: Duration,
    interval: Duration,
    total_ticks: u64,
    dropped_ticks: u64,
}

impl TickSchedule {
    /// Schedule at `hz` ticks per second. A rate of 0 is treated as 1.
    pub fn with_tick_rate(hz: u32) -> Self {
        Self::with_interval(Duration::from_secs(1) / hz.max(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            accumulator: Duration::ZERO,
            interval: interval.max(Duration::from_micros(1)),
            total_ticks: 0,
            dropped_ticks: 0,
        }
    }

    /// Add elapsed time and return how many ticks to run now.
    pub fn accumulate(&mut self, elapsed: Duration) -> u32 {
        self.accumulator = self.accumulator.saturating_add(elapsed);
        let interval = self.interval.as_nanos();
        let pending = self.accumulator.as_nanos();
        let due = pending / interval;
        self.accumulator = Duration::from_nanos(u64::try_from(pending % interval).unwrap_or(u64::MAX));

        let ticks = due.min(u128::from(MAX_CATCH_UP_TICKS)) as u32;
        let dropped = u64::try_from(due - u128::from(ticks)).unwrap_or(u64::MAX);
        self.dropped_ticks = self.dropped_ticks.saturating_add(dropped);
        self.total_ticks += u64::from(ticks);
        ticks
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Ticks skipped because the loop fell too far behind.
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left until the next tick is due.
    pub fn until_next(&self) -> Duration {
        self.interval.saturating_sub(self.accumulator)
    }
}

impl Default for TickSchedule {
    /// 20 Hz.
    fn default() -> Self {
        Self::with_tick_rate(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_interval_yields_nothing() {
        let mut schedule = TickSchedule::with_tick_rate(20);
        assert_eq!(schedule.accumulate(Duration::from_millis(30)), 0);
        assert_eq!(schedule.until_next(), Duration::from_millis(20));
        assert_eq!(schedule.accumulate(Duration::from_millis(20)), 1);
        assert_eq!(schedule.total_ticks(), 1);
    }

    #[test]
    fn test_remainder_carries_over() {
        let mut schedule = TickSchedule::with_interval(Duration::from_millis(10));
        assert_eq!(schedule.accumulate(Duration::from_millis(25)), 2);
        assert_eq!(schedule.accumulate(Duration::from_millis(5)), 1);
        assert_eq!(schedule.total_ticks(), 3);
    }

    #[test]
    fn test_long_stall_is_capped() {
        let mut schedule = TickSchedule::with_interval(Duration::from_millis(10));
        assert_eq!(schedule.accumulate(Duration::from_secs(1)), MAX_CATCH_UP_TICKS);
        assert_eq!(schedule.dropped_ticks(), 100 - u64::from(MAX_CATCH_UP_TICKS));
        assert_eq!(schedule.accumulate(Duration::ZERO), 0);
    }

    #[test]
    fn test_years_long_stall_is_counted_not_replayed() {
        let mut schedule = TickSchedule::with_interval(Duration::from_micros(1));
        let stall = Duration::from_secs(365 * 24 * 3600);
        assert_eq!(schedule.accumulate(stall), MAX_CATCH_UP_TICKS);
        let due = stall.as_micros() as u64;
        assert_eq!(schedule.dropped_ticks(), due - u64::from(MAX_CATCH_UP_TICKS));
        assert_eq!(schedule.until_next(), Duration::from_micros(1));
        assert_eq!(schedule.accumulate(Duration::from_nanos(1_500)), 1);
        assert_eq!(schedule.until_next(), Duration::from_nanos(500));
    }

    #[test]
    fn test_zero_rate_does_not_divide_by_zero() {
        let schedule = TickSchedule::with_tick_rate(0);
        assert_eq!(schedule.interval(), Duration::from_secs(1));
    }
}

//! # Tick Pacing
//!
//! Fixed-timestep pacing for the shard loop. The shard rate comes from
//! [`crate::ShardConfig::tick_rate`].
//!
//! ## Design
//!
//! - Elapsed wall time accumulates; one tick is due per tick duration
//! - A backlog longer than [`MAX_BACKLOG_TICKS`] is dropped instead of
//!   replayed in a burst, and counted as skipped
//! - Idle waiting sleeps most of the gap and spins the last stretch

use std::time::{Duration, Instant};

/// Most overdue ticks caught up after a stall.
pub const MAX_BACKLOG_TICKS: u32 = 5;

const SPIN_WINDOW: Duration = Duration::from_micros(500);

/// Fixed-timestep tick pacer.
pub struct TickLoop {
    tick_duration: Duration,
    last_poll: Instant,
    accumulator: Duration,
    tick_count: u64,
    stats: TickStats,
}

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickStats {
    /// Shortest tick observed.
    pub min_tick_us: u64,
    /// Longest tick observed.
    pub max_tick_us: u64,
    /// Exponential moving average, weight 1/16.
    pub avg_tick_us: u64,
    /// Ticks that overran their budget.
    pub late_ticks: u64,
    /// Due ticks dropped from an oversized backlog.
    pub skipped_ticks: u64,
    /// Ticks measured.
    pub total_ticks: u64,
}

impl TickStats {
    fn fresh(tick_duration: Duration) -> Self {
        Self {
            min_tick_us: u64::MAX,
            max_tick_us: 0,
            avg_tick_us: micros(tick_duration),
            late_ticks: 0,
            skipped_ticks: 0,
            total_ticks: 0,
        }
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl TickLoop {
    /// Creates a pacer running at `tick_rate` Hz. A rate of 0 is treated
    /// as 1.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        let tick_duration = Duration::from_secs(1) / tick_rate.max(1);
        Self {
            tick_duration,
            last_poll: Instant::now(),
            accumulator: Duration::ZERO,
            tick_count: 0,
            stats: TickStats::fresh(tick_duration),
        }
    }

    /// True if a tick is due. Call until it returns false.
    #[must_use]
    pub fn should_tick(&mut self) -> bool {
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_poll);
        self.last_poll = now;

        let backlog = self.tick_duration * MAX_BACKLOG_TICKS;
        if self.accumulator > backlog {
            let overdue = self.accumulator - backlog;
            let dropped = overdue.as_nanos() / self.tick_duration.as_nanos().max(1);
            self.stats.skipped_ticks += u64::try_from(dropped).unwrap_or(u64::MAX);
            tracing::warn!(dropped = %dropped, "tick backlog dropped");
            self.accumulator = backlog;
        }
        self.accumulator >= self.tick_duration
    }

    /// Consumes one due tick and returns its start time.
    #[must_use]
    pub fn begin_tick(&mut self) -> Instant {
        self.accumulator = self.accumulator.saturating_sub(self.tick_duration);
        self.tick_count += 1;
        Instant::now()
    }

    /// Records the duration of the tick started at `start`.
    pub fn end_tick(&mut self, start: Instant) {
        let elapsed = start.elapsed();
        let elapsed_us = micros(elapsed);
        let stats = &mut self.stats;
        stats.total_ticks += 1;
        stats.min_tick_us = stats.min_tick_us.min(elapsed_us);
        stats.max_tick_us = stats.max_tick_us.max(elapsed_us);
        stats.avg_tick_us = (stats.avg_tick_us.saturating_mul(15).saturating_add(elapsed_us)) / 16;
        if elapsed > self.tick_duration {
            stats.late_ticks += 1;
            tracing::debug!(elapsed_us, budget_us = micros(self.tick_duration), "late tick");
        }
    }

    /// Blocks until the next tick is due.
    pub fn wait_for_next_tick(&self) {
        let due = self.tick_duration.saturating_sub(self.accumulator);
        let deadline = self.last_poll + due;
        let now = Instant::now();
        if deadline <= now {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_WINDOW * 2 {
            std::thread::sleep(remaining - SPIN_WINDOW);
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    /// Ticks begun so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Timing statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Target tick duration.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Clears statistics.
    pub fn reset_stats(&mut self) {
        self.stats = TickStats::fresh(self.tick_duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_duration_from_rate() {
        assert_eq!(TickLoop::new(20).tick_duration(), Duration::from_millis(50));
        assert_eq!(TickLoop::new(0).tick_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_tick_due_after_wait() {
        let mut pacer = TickLoop::new(1000);
        pacer.wait_for_next_tick();
        assert!(pacer.should_tick());
        let start = pacer.begin_tick();
        pacer.end_tick(start);
        assert_eq!(pacer.tick_count(), 1);
        assert_eq!(pacer.stats().total_ticks, 1);
    }

    #[test]
    fn test_stall_drops_backlog() {
        let mut pacer = TickLoop::new(1000);
        std::thread::sleep(Duration::from_millis(30));
        let mut ran = 0;
        while pacer.should_tick() {
            let start = pacer.begin_tick();
            pacer.end_tick(start);
            ran += 1;
        }
        assert!(ran <= 2 * MAX_BACKLOG_TICKS as usize, "ran {ran} ticks");
        assert!(pacer.stats().skipped_ticks > 0);
    }

    #[test]
    fn test_stats_and_reset() {
        let mut pacer = TickLoop::new(100);
        for _ in 0..3 {
            let start = pacer.begin_tick();
            std::thread::sleep(Duration::from_millis(1));
            pacer.end_tick(start);
        }
        let stats = *pacer.stats();
        assert_eq!(stats.total_ticks, 3);
        assert!(stats.min_tick_us >= 1_000);
        assert!(stats.min_tick_us <= stats.max_tick_us);

        pacer.reset_stats();
        assert_eq!(pacer.stats().total_ticks, 0);
        assert_eq!(pacer.stats().avg_tick_us, 10_000);
    }
}

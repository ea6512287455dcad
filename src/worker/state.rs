//! Scheduler state — per-task timing and failure counters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, RngCore};

use crate::images::RateLimiter;

/// Largest backoff exponent: the delay grows at most 16x.
const MAX_BACKOFF_EXPONENT: u32 = 4;

/// A recurring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Mail,
    Social,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Social => "social",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and health of one task.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    pub interval: Duration,
    pub jitter: Duration,
    pub next_due: DateTime<Utc>,
    pub consecutive_failures: u32,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl TaskSchedule {
    /// A schedule whose first run is due at `first_due`.
    pub fn new(interval: Duration, jitter: Duration, first_due: DateTime<Utc>) -> Self {
        Self {
            interval,
            jitter,
            next_due: first_due,
            consecutive_failures: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_due
    }

    /// Uniform sample in `[0, jitter]` at millisecond resolution.
    pub fn sample_jitter(&self, rng: &mut (dyn RngCore + Send)) -> Duration {
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }

    /// Delay before the next run given the current failure count.
    ///
    /// `interval` on success; `interval * 2^min(failures, 4)` after failures,
    /// capped at `max_backoff` but never below `interval`.
    pub fn base_delay(&self, max_backoff: Duration) -> Duration {
        if self.consecutive_failures == 0 {
            return self.interval;
        }
        let exponent = self.consecutive_failures.min(MAX_BACKOFF_EXPONENT);
        let backoff = self.interval.saturating_mul(1u32 << exponent);
        backoff.min(max_backoff.max(self.interval))
    }

    /// Saturates at the latest representable instant instead of overflowing.
    fn reschedule(
        &mut self,
        now: DateTime<Utc>,
        max_backoff: Duration,
        rng: &mut (dyn RngCore + Send),
    ) {
        let delay = self.base_delay(max_backoff).saturating_add(self.sample_jitter(rng));
        self.next_due = now
            .checked_add_signed(to_chrono(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn record_success(
        &mut self,
        now: DateTime<Utc>,
        max_backoff: Duration,
        rng: &mut (dyn RngCore + Send),
    ) {
        self.consecutive_failures = 0;
        self.reschedule(now, max_backoff, rng);
    }

    /// Count a failure and back off. Returns the new failure count.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        max_backoff: Duration,
        rng: &mut (dyn RngCore + Send),
    ) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.reschedule(now, max_backoff, rng);
        self.consecutive_failures
    }
}

/// Everything the scheduler owns across ticks.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub mail: TaskSchedule,
    /// `None` when the social task is disabled.
    pub social: Option<TaskSchedule>,
    /// Lent to the mail cycle for metered image generation.
    pub image_limiter: RateLimiter,
}

impl SchedulerState {
    pub fn schedule(&self, task: TaskKind) -> Option<&TaskSchedule> {
        match task {
            TaskKind::Mail => Some(&self.mail),
            TaskKind::Social => self.social.as_ref(),
        }
    }

    pub fn schedule_mut(&mut self, task: TaskKind) -> Option<&mut TaskSchedule> {
        match task {
            TaskKind::Mail => Some(&mut self.mail),
            TaskKind::Social => self.social.as_mut(),
        }
    }

    /// Earliest instant any task becomes due.
    pub fn next_wake(&self) -> DateTime<Utc> {
        match &self.social {
            Some(social) => self.mail.next_due.min(social.next_due),
            None => self.mail.next_due,
        }
    }
}

//! Fixed-window token counter for metered image generation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;

/// Grants at most `quota` tokens per `window`.
///
/// The window opens at the first acquisition and resets once `window` has
/// elapsed since it opened. A quota of zero never grants.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    quota: u32,
    window: Duration,
    window_start: Option<DateTime<Utc>>,
    used: u32,
}

impl RateLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            quota,
            window,
            window_start: None,
            used: 0,
        }
    }

    fn roll_window(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let expired = match self.window_start {
            None => true,
            // A clock that jumped backwards also starts a fresh window.
            Some(start) => now < start || now.signed_duration_since(start) >= window,
        };
        if expired {
            self.window_start = Some(now);
            self.used = 0;
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if self.quota == 0 {
            return false;
        }
        self.roll_window(now);
        if self.used < self.quota {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Tokens still available in the window containing `now`.
    pub fn remaining(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll_window(now);
        self.quota.saturating_sub(self.used)
    }

    /// The error reported when no token is available.
    pub fn exhausted(&self) -> Error {
        Error::RateLimitExhausted {
            quota: self.quota,
            window: self.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn grants_up_to_quota_then_refuses() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(3600));
        assert!(limiter.try_acquire(t0()));
        assert!(limiter.try_acquire(t0() + chrono::Duration::minutes(1)));
        assert!(!limiter.try_acquire(t0() + chrono::Duration::minutes(2)));
        assert_eq!(limiter.remaining(t0() + chrono::Duration::minutes(3)), 0);
    }

    #[test]
    fn window_elapse_resets_counter() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(3600));
        assert!(limiter.try_acquire(t0()));
        assert!(!limiter.try_acquire(t0() + chrono::Duration::minutes(59)));
        assert!(limiter.try_acquire(t0() + chrono::Duration::minutes(60)));
    }

    #[test]
    fn zero_quota_never_grants() {
        let mut limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.try_acquire(t0()));
        assert!(!limiter.try_acquire(t0() + chrono::Duration::days(2)));
        assert!(matches!(
            limiter.exhausted(),
            Error::RateLimitExhausted { quota: 0, .. }
        ));
    }

    #[test]
    fn backwards_clock_opens_new_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(3600));
        assert!(limiter.try_acquire(t0()));
        assert!(limiter.try_acquire(t0() - chrono::Duration::minutes(5)));
    }
}

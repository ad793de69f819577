//! Reconnect backoff accounting.

use std::time::Duration;

/// Exponential backoff with a cap and a bounded attempt count.
///
/// `attempt` counts involuntary closes since the last successful open. The
/// n-th consecutive close waits `min(base * 2^n, cap)`, starting at n = 0.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 already saturates any sane cap.
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn on_open(&mut self) {
        self.attempt = 0;
    }

    pub fn on_manual_connect(&mut self) {
        self.attempt = 0;
    }

    /// Account for a close that was not requested locally. Returns the delay
    /// before the next attempt, or `None` once the budget is spent.
    pub fn on_involuntary_close(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 8)
    }

    #[test]
    fn delays_double_until_the_cap() {
        let mut p = policy();
        let delays: Vec<u64> = std::iter::from_fn(|| p.on_involuntary_close())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn successful_open_resets_the_sequence() {
        let mut p = policy();
        p.on_involuntary_close();
        p.on_involuntary_close();
        assert_eq!(p.attempt(), 2);
        p.on_open();
        assert_eq!(p.on_involuntary_close(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn budget_exhaustion_stops_retries_until_manual_connect() {
        let mut p = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_secs(1), 2);
        assert!(p.on_involuntary_close().is_some());
        assert!(p.on_involuntary_close().is_some());
        assert!(p.on_involuntary_close().is_none());
        p.on_manual_connect();
        assert_eq!(p.on_involuntary_close(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn huge_attempts_saturate_at_cap() {
        let p = policy();
        assert_eq!(p.delay_for(63), Duration::from_secs(30));
    }
}

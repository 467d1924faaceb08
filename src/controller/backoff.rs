//! Per-key exponential backoff for failed reconciles
//!
//! Mirrors the classic controller work-queue rate limiter: each key's delay
//! doubles from a small base up to a hard cap, and a successful reconcile
//! forgets the key so the next failure starts small again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// The work-queue default: 5ms doubling up to 1000s
    pub fn workqueue_default() -> Self {
        Backoff::new(Duration::from_millis(5), Duration::from_secs(1000))
    }

    /// Delay before the next retry of `key`, recording the failure
    pub fn next(&self, key: &str) -> Duration {
        let mut attempts = self.lock();
        let failures = attempts.entry(key.to_string()).or_insert(0);
        // 2^failures, clamped well past the point where the cap takes over
        let exponent = (*failures).min(28);
        *failures = failures.saturating_add(1);

        self.base.saturating_mul(1 << exponent).min(self.max)
    }

    /// Clear the failure history for `key` after a successful reconcile
    pub fn forget(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::workqueue_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_key() {
        let backoff = Backoff::workqueue_default();
        assert_eq!(backoff.next("a"), Duration::from_millis(5));
        assert_eq!(backoff.next("a"), Duration::from_millis(10));
        assert_eq!(backoff.next("a"), Duration::from_millis(20));
        // an unrelated key starts from the base
        assert_eq!(backoff.next("b"), Duration::from_millis(5));
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let mut delay = Duration::ZERO;
        for _ in 0..40 {
            delay = backoff.next("a");
        }
        assert_eq!(delay, Duration::from_secs(1000));
    }

    #[test]
    fn forget_resets_the_key() {
        let backoff = Backoff::workqueue_default();
        backoff.next("a");
        backoff.next("a");
        backoff.forget("a");
        assert_eq!(backoff.next("a"), Duration::from_millis(5));
    }
}

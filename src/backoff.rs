use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Duration;

/// Exponential per-object retry delays: `base`, `2 * base`, `4 * base`, ... capped at `max`.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the next retry of `key`, counting this failure.
    pub fn next(&self, key: &str) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(*attempt))
            .map_or(self.max, |d| d.min(self.max));
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Forget the failures of `key` after it reconciled cleanly.
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}

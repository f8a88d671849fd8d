use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Two-tier retry interval policy.
///
/// With `max_short_attempts == 0` every retry uses the short interval.
/// Otherwise the first `max_short_attempts` retries use the short interval,
/// the next one uses the long interval and the budget starts over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub short_interval_secs: u64,
    pub long_interval_secs: u64,
    pub max_short_attempts: u32,
    #[serde(skip)]
    attempt_counter: u32,
}

impl ReconnectPolicy {
    pub fn new(short_interval_secs: u64, long_interval_secs: u64, max_short_attempts: u32) -> Self {
        Self {
            short_interval_secs,
            long_interval_secs,
            max_short_attempts,
            attempt_counter: 0,
        }
    }

    /// Delay before the next retry. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        if self.max_short_attempts == 0 {
            return Duration::from_secs(self.short_interval_secs);
        }

        if self.attempt_counter < self.max_short_attempts {
            self.attempt_counter += 1;
            Duration::from_secs(self.short_interval_secs)
        } else {
            self.attempt_counter = 0;
            Duration::from_secs(self.long_interval_secs)
        }
    }

    pub fn attempt_counter(&self) -> u32 {
        self.attempt_counter
    }

    pub fn reset(&mut self) {
        self.attempt_counter = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, 10, 0)
    }
}

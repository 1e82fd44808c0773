use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DakaraError, Result};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Highest doubling applied to the base delay; later attempts saturate here.
const MAX_SHIFT: u32 = 31;

/// Exponential reconnection backoff.
///
/// The delay for attempt `n` (0-indexed) is `base_delay × 2^n`, clamped to
/// `max_delay`. No jitter is applied, so the sequence is non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Result<Self> {
        let policy = Self {
            base_delay,
            max_delay,
            max_attempts: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_delay > self.max_delay {
            return Err(DakaraError::ConfigurationError(format!(
                "Reconnect base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(DakaraError::ConfigurationError(
                "Reconnect max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_SHIFT);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether `attempts` consecutive failures exhaust the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}

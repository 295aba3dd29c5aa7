//! Per-job delivery options: attempts, backoff, initial delay and retention

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_BACKOFF_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempts_made - 1)`
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Wait before the next attempt, given how many attempts already ran.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                Duration::from_millis(delay_ms.saturating_mul(1_u64 << exponent))
            }
        }
    }
}

/// Retention for finished jobs. Either bound may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepJobs {
    pub count: Option<u64>,
    pub age_secs: Option<u64>,
}

impl KeepJobs {
    pub const fn new(count: u64, age_secs: u64) -> Self {
        Self {
            count: Some(count),
            age_secs: Some(age_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts including the first.
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    /// Initial delay before the first attempt becomes claimable.
    #[serde(default)]
    pub delay_ms: u64,
    /// `None` keeps completed jobs forever.
    #[serde(default)]
    pub remove_on_complete: Option<KeepJobs>,
    #[serde(default)]
    pub remove_on_fail: Option<KeepJobs>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: None,
            delay_ms: 0,
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }
}

impl JobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .map(|backoff| backoff.delay_for(attempts_made))
            .unwrap_or(Duration::ZERO)
    }
}

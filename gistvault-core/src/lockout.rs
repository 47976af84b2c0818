//! Failed attempt lockout mechanism to slow down PIN guessing

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default maximum failed attempts before lockout
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default lockout duration in seconds
pub const DEFAULT_LOCKOUT_SECONDS: i64 = 30;

/// Lockout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Consecutive failed attempts that trigger a lockout
    pub max_attempts: u32,
    /// Fixed lockout duration in seconds
    pub lockout_seconds: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_seconds: DEFAULT_LOCKOUT_SECONDS,
        }
    }
}

impl LockoutConfig {
    pub fn lockout_duration(&self) -> Duration {
        Duration::seconds(self.lockout_seconds.max(0))
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts_remaining: u32,
    pub locked_out_until: Option<DateTime<Utc>>,
}

/// In-memory counter of consecutive failures.
///
/// Deliberately not persisted: the counter resets when the process restarts.
#[derive(Debug, Clone)]
pub struct LockoutTracker {
    config: LockoutConfig,
    failed_attempts: u32,
    locked_until: Option<DateTime<Utc>>,
}

impl LockoutTracker {
    pub fn new(config: LockoutConfig) -> Self {
        Self {
            config,
            failed_attempts: 0,
            locked_until: None,
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.failed_attempts)
    }

    /// Expire a finished lockout. Returns true if one just ended.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        match self.locked_until {
            Some(until) if now >= until => {
                self.locked_until = None;
                self.failed_attempts = 0;
                true
            }
            _ => false,
        }
    }

    /// End of the active lockout, if any, as of `now`.
    pub fn locked_until(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.refresh(now);
        self.locked_until
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> FailureRecord {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= self.config.max_attempts {
            self.locked_until = Some(now + self.config.lockout_duration());
        }
        FailureRecord {
            attempts_remaining: self.attempts_remaining(),
            locked_out_until: self.locked_until,
        }
    }

    /// Clear all failed attempt state (e.g., after successful verification)
    pub fn clear(&mut self) {
        self.failed_attempts = 0;
        self.locked_until = None;
    }
}

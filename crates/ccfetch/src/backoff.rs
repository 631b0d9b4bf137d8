//! Retry backoff
//!
//! [`BackoffPolicy`] is a pure mapping from a failed attempt number to the
//! wait before the next attempt. The last schedule entry repeats once the
//! schedule runs out; the sequence ends at the explicit attempt ceiling.
//!
//! Waiting goes through the [`Sleeper`] trait so tests can record waits
//! instead of spending real time.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Waits between attempts, in seconds, when none are configured
pub const DEFAULT_THROTTLE_SECONDS: [u64; 4] = [30, 120, 600, 1800];

/// Attempt ceiling when none is configured; uses every default wait once
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Ordered wait durations, indexed by failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    waits: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(waits: Vec<Duration>) -> Self {
        Self { waits }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Wait after the given zero-based failure, repeating the last entry.
    pub fn wait_for(&self, failure_index: usize) -> Option<Duration> {
        let last = self.waits.len().checked_sub(1)?;
        self.waits.get(failure_index.min(last)).copied()
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_THROTTLE_SECONDS)
    }
}

/// Schedule plus attempt ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    schedule: BackoffSchedule,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(schedule: BackoffSchedule, max_attempts: u32) -> Self {
        Self {
            schedule,
            max_attempts,
        }
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait to take after attempt `attempt` (1-based) failed transiently.
    ///
    /// `None` means the attempt budget is spent and the fetch is exhausted.
    pub fn wait_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        self.schedule.wait_for((attempt - 1) as usize)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffSchedule::default(), DEFAULT_MAX_ATTEMPTS)
    }
}

/// Suspension point between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real-time sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately and remembers every requested wait.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

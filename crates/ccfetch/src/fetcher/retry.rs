//! Retry decorator
//!
//! Drives one fetch through
//! `Pending -> (Attempting -> Waiting)* -> Succeeded | FailedPermanent | FailedExhausted`.
//! A transient failure moves to `Waiting` while the policy still grants an
//! attempt, and a permanent failure ends the fetch at once. `Waiting` is the
//! only suspension point. No shared lock is held there, so a waiting worker
//! never delays the others.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{FetchError, FetchFailure, FetchOutcome, FetchState, RangeFetcher};
use crate::backoff::{BackoffPolicy, Sleeper, TokioSleeper};

pub struct BackoffFetcher {
    inner: Arc<dyn RangeFetcher>,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl BackoffFetcher {
    pub fn new(inner: Arc<dyn RangeFetcher>, policy: BackoffPolicy) -> Self {
        Self::with_sleeper(inner, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        inner: Arc<dyn RangeFetcher>,
        policy: BackoffPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner,
            policy,
            sleeper,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &'static str {
        self.inner.name()
    }

    /// Fetch with retries, reporting how the fetch ended.
    pub async fn fetch(&self, location: &str, start: u64, length: u64) -> FetchOutcome {
        let mut state = FetchState::Pending;

        loop {
            state = match state {
                FetchState::Pending => FetchState::Attempting { attempt: 1 },

                FetchState::Attempting { attempt } => {
                    match self.inner.fetch_range(location, start, length).await {
                        Ok(payload) => {
                            return FetchOutcome::Fetched { payload, attempts: attempt };
                        }
                        Err(err) if !err.is_transient() => {
                            debug!(location, attempt, error = %err, "Permanent fetch failure");
                            return FetchOutcome::Failed {
                                failure: FetchFailure::Permanent(err),
                                attempts: attempt,
                            };
                        }
                        Err(err) => match self.policy.wait_after(attempt) {
                            Some(wait) => {
                                warn!(
                                    location,
                                    attempt,
                                    max_attempts = self.policy.max_attempts(),
                                    wait_secs = wait.as_secs(),
                                    error = %err,
                                    "Transient fetch failure, backing off"
                                );
                                FetchState::Waiting { attempt, wait }
                            }
                            None => {
                                warn!(location, attempt, error = %err, "Fetch attempts exhausted");
                                return FetchOutcome::Failed {
                                    failure: FetchFailure::Exhausted(err),
                                    attempts: attempt,
                                };
                            }
                        },
                    }
                }

                FetchState::Waiting { attempt, wait } => {
                    self.sleeper.sleep(wait).await;
                    FetchState::Attempting {
                        attempt: attempt + 1,
                    }
                }

                // Terminal states are returned directly above.
                terminal => {
                    return FetchOutcome::Failed {
                        failure: FetchFailure::Permanent(FetchError::permanent(format!(
                            "fetch state machine re-entered {:?}",
                            terminal
                        ))),
                        attempts: 0,
                    };
                }
            };
        }
    }
}

#[async_trait]
impl RangeFetcher for BackoffFetcher {
    async fn fetch_range(
        &self,
        location: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, FetchError> {
        match self.fetch(location, start, length).await {
            FetchOutcome::Fetched { payload, .. } => Ok(payload),
            FetchOutcome::Failed { failure, .. } => Err(failure.error().clone()),
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

//! Periodic progress reporting

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::quota::{QuotaSnapshot, QuotaTracker};

/// Default interval between progress log lines
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest accepted interval; `tokio::time::interval` rejects zero.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(10);

type Observer = Box<dyn Fn(&QuotaSnapshot) + Send + Sync>;

/// Samples a [`QuotaTracker`] on a fixed interval.
pub struct ProgressReporter {
    quota: Arc<QuotaTracker>,
    interval: Duration,
    log: bool,
    observer: Option<Observer>,
}

impl ProgressReporter {
    pub fn new(quota: Arc<QuotaTracker>) -> Self {
        Self {
            quota,
            interval: DEFAULT_REPORT_INTERVAL,
            log: true,
            observer: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_REPORT_INTERVAL);
        self
    }

    /// Disable the `info` line, e.g. when only driving a spinner.
    pub fn without_log(mut self) -> Self {
        self.log = false;
        self
    }

    /// Called with every sample.
    pub fn with_observer(
        mut self,
        observer: impl Fn(&QuotaSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn spawn(self) -> ProgressHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => self.report(),
                }
            }
        });

        ProgressHandle {
            stop: Some(stop_tx),
            handle,
        }
    }

    fn report(&self) {
        let snapshot = self.quota.snapshot();
        if self.log {
            info!(
                records_seen = snapshot.records_seen,
                files_extracted = snapshot.files_extracted,
                files_truncated = snapshot.files_truncated,
                in_flight = snapshot.extraction_in_flight,
                "Progress"
            );
        }
        if let Some(observer) = &self.observer {
            observer(&snapshot);
        }
    }
}

/// Stops the reporter task when asked or when dropped.
pub struct ProgressHandle {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ProgressHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.handle.abort();
        }
    }
}

//! Fetch pipeline
//!
//! One producer reads the index on a blocking thread, counts each record
//! against the record ceiling, applies the selector and pushes accepted
//! records into a bounded queue. A fixed pool of workers takes records off the
//! queue and carries each one end to end:
//!
//! ```text
//! capped?  -> truncate
//! rewrite name -> reserve slot -> fetch (with backoff) -> decode WARC -> emit -> commit
//!                                      \ failure: release slot ---------------> truncate
//! ```
//!
//! Reaching a ceiling stops admission. Records already in flight finish
//! normally, and records still queued are dropped without being fetched. A
//! worker that finds every remaining extraction slot held by in-flight records
//! waits for one of them to settle before it fetches anything.

use ccfetch_common::{HarvestError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::emitter::{Emitter, StoreOutcome};
use crate::fetcher::{BackoffFetcher, FetchOutcome};
use crate::index::IndexSource;
use crate::quota::QuotaTracker;
use crate::record::IndexRecord;
use crate::rewriter::{DigestPathRewriter, PathRewriter};
use crate::selector::{AcceptAll, RecordSelector};
use crate::truncated::TruncatedLog;
use crate::warc::WarcRecord;

// far beyond any useful read-ahead; tokio channels reject larger bounds
const MAX_QUEUE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Default)]
struct RunCounters {
    selected: AtomicU64,
    skipped_by_selector: AtomicU64,
    dropped_over_quota: AtomicU64,
    emit_skips: AtomicU64,
    malformed_index_lines: AtomicU64,
}

impl RunCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Totals for a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub records_seen: u64,
    pub selected: u64,
    pub skipped_by_selector: u64,
    pub files_extracted: u64,
    pub files_truncated: u64,
    /// Records admitted but not processed because a ceiling was reached
    pub dropped_over_quota: u64,
    /// Stored objects whose target already existed
    pub emit_skips: u64,
    /// Index lines skipped because they could not be parsed
    pub malformed_index_lines: u64,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seen={} selected={} skipped={} extracted={} truncated={} dropped={} existing={} \
             malformed={} elapsed={:.1}s",
            self.records_seen,
            self.selected,
            self.skipped_by_selector,
            self.files_extracted,
            self.files_truncated,
            self.dropped_over_quota,
            self.emit_skips,
            self.malformed_index_lines,
            self.elapsed.as_secs_f64()
        )
    }
}

/// State shared by every worker.
struct WorkerContext {
    fetcher: Arc<BackoffFetcher>,
    emitter: Arc<dyn Emitter>,
    rewriter: Arc<dyn PathRewriter>,
    quota: Arc<QuotaTracker>,
    truncated_log: Arc<TruncatedLog>,
    counters: Arc<RunCounters>,
    dry_run: bool,
}

pub struct Pipeline {
    fetcher: Arc<BackoffFetcher>,
    emitter: Arc<dyn Emitter>,
    truncated_log: Arc<TruncatedLog>,
    quota: Arc<QuotaTracker>,
    selector: Arc<dyn RecordSelector>,
    rewriter: Arc<dyn PathRewriter>,
    workers: usize,
    queue_capacity: usize,
    dry_run: bool,
}

impl Pipeline {
    pub fn new(
        fetcher: BackoffFetcher,
        emitter: Arc<dyn Emitter>,
        truncated_log: TruncatedLog,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            emitter,
            truncated_log: Arc::new(truncated_log),
            quota,
            selector: Arc::new(AcceptAll),
            rewriter: Arc::new(DigestPathRewriter::default()),
            workers: crate::config::DEFAULT_NUM_THREADS,
            queue_capacity: 0,
            dry_run: false,
        }
    }

    /// Build every collaborator named by a validated configuration.
    ///
    /// Opening the truncated log and constructing the backends happens here,
    /// before any record is read.
    pub async fn from_config(config: &RunConfig, quota: Arc<QuotaTracker>) -> Result<Self> {
        let truncated_log = TruncatedLog::open(&config.truncated_urls_file).await?;
        let backend = config.backend.build().await?;
        let emitter = config.sink.build().await;

        Ok(Self::new(
            BackoffFetcher::new(backend, config.backoff.clone()),
            emitter,
            truncated_log,
            quota,
        )
        .with_selector(config.selector())
        .with_rewriter(config.rewriter())
        .with_workers(config.num_threads)
        .with_queue_capacity(config.queue_capacity)
        .with_dry_run(config.dry_run))
    }

    pub fn with_selector(mut self, selector: Arc<dyn RecordSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn PathRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Process every record from `source` until it ends or a ceiling is hit.
    ///
    /// Per-record failures never end the run. An unreadable index, a
    /// truncated log that cannot be written, or a crashed worker does.
    pub async fn run(self, source: Box<dyn IndexSource>) -> Result<RunSummary> {
        let started = Instant::now();
        let counters = Arc::new(RunCounters::default());
        let capacity = if self.queue_capacity == 0 {
            self.workers.saturating_mul(4)
        } else {
            self.queue_capacity
        }
        .min(MAX_QUEUE_CAPACITY);

        info!(
            workers = self.workers,
            queue_capacity = capacity,
            backend = self.fetcher.backend(),
            sink = %self.emitter.describe(),
            dry_run = self.dry_run,
            "Starting pipeline"
        );

        let (tx, rx) = mpsc::channel::<IndexRecord>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let producer = {
            let quota = self.quota.clone();
            let selector = self.selector.clone();
            let counters = counters.clone();
            tokio::task::spawn_blocking(move || {
                produce(source, tx, &quota, selector.as_ref(), &counters)
            })
        };

        let ctx = Arc::new(WorkerContext {
            fetcher: self.fetcher.clone(),
            emitter: self.emitter.clone(),
            rewriter: self.rewriter.clone(),
            quota: self.quota.clone(),
            truncated_log: self.truncated_log.clone(),
            counters: counters.clone(),
            dry_run: self.dry_run,
        });

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker_loop(id, ctx.clone(), rx.clone()));
        }
        drop(rx);

        let mut failure: Option<HarvestError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| HarvestError::Worker(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = result {
                error!(error = %e, "Worker stopped with a fatal error");
                self.quota.halt();
                failure.get_or_insert(e);
            }
        }

        let produced = producer
            .await
            .map_err(|e| HarvestError::Worker(format!("index producer panicked: {}", e)))
            .and_then(|r| r);
        if let Err(e) = produced {
            failure.get_or_insert(e);
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let snapshot = self.quota.snapshot();
        let summary = RunSummary {
            records_seen: snapshot.records_seen,
            selected: counters.selected.load(Ordering::Relaxed),
            skipped_by_selector: counters.skipped_by_selector.load(Ordering::Relaxed),
            files_extracted: snapshot.files_extracted,
            files_truncated: snapshot.files_truncated,
            dropped_over_quota: counters.dropped_over_quota.load(Ordering::Relaxed),
            emit_skips: counters.emit_skips.load(Ordering::Relaxed),
            malformed_index_lines: counters.malformed_index_lines.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };

        info!(summary = %summary, "Pipeline finished");
        Ok(summary)
    }
}

/// Read the index into the queue. Runs on a blocking thread.
fn produce(
    mut source: Box<dyn IndexSource>,
    tx: mpsc::Sender<IndexRecord>,
    quota: &QuotaTracker,
    selector: &dyn RecordSelector,
    counters: &RunCounters,
) -> Result<()> {
    let fed = feed(source.as_mut(), &tx, quota, selector, counters);
    counters
        .malformed_index_lines
        .store(source.malformed_lines(), Ordering::Relaxed);
    fed
}

fn feed(
    source: &mut dyn IndexSource,
    tx: &mpsc::Sender<IndexRecord>,
    quota: &QuotaTracker,
    selector: &dyn RecordSelector,
    counters: &RunCounters,
) -> Result<()> {
    loop {
        if quota.should_stop() {
            debug!("Quota reached, no longer reading the index");
            return Ok(());
        }

        let record = match source.next_record() {
            None => return Ok(()),
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                quota.halt();
                return Err(e);
            }
        };

        if !quota.try_admit_record() {
            return Ok(());
        }

        if !selector.accepts(&record) {
            RunCounters::bump(&counters.skipped_by_selector);
            continue;
        }
        RunCounters::bump(&counters.selected);

        if tx.blocking_send(record).is_err() {
            // every worker has exited
            return Ok(());
        }
    }
}

async fn worker_loop(
    id: usize,
    ctx: Arc<WorkerContext>,
    rx: Arc<Mutex<mpsc::Receiver<IndexRecord>>>,
) -> Result<()> {
    debug!(worker = id, "Worker started");

    loop {
        // the lock is held only while waiting for the next record
        let next = rx.lock().await.recv().await;
        let Some(record) = next else {
            break;
        };

        if ctx.quota.outputs_exhausted() {
            RunCounters::bump(&ctx.counters.dropped_over_quota);
            continue;
        }

        ctx.process(record).await?;
    }

    debug!(worker = id, "Worker finished");
    Ok(())
}

impl WorkerContext {
    async fn process(&self, record: IndexRecord) -> Result<()> {
        if record.is_capped() {
            debug!(url = %record.url, "Record marked truncated in index");
            return self.truncate(&record, "capped in index").await;
        }

        let name = self.rewriter.rewrite(&record);

        if self.dry_run {
            if self.quota.try_count_extracted() {
                info!(url = %record.url, target = %name, "Dry run, would fetch and store");
            } else {
                RunCounters::bump(&self.counters.dropped_over_quota);
            }
            return Ok(());
        }

        // room is claimed before any network traffic and held until the emit settles
        let Some(slot) = self.quota.reserve_extracted().await else {
            debug!(url = %record.url, "Extraction ceiling reached, dropping record");
            RunCounters::bump(&self.counters.dropped_over_quota);
            return Ok(());
        };
        if self.quota.outputs_exhausted() {
            drop(slot);
            RunCounters::bump(&self.counters.dropped_over_quota);
            return Ok(());
        }

        let body = match self.fetch_payload(&record).await {
            Ok(body) => body,
            Err(reason) => {
                drop(slot);
                return self.truncate(&record, reason).await;
            }
        };

        match self.emitter.store(&name, body).await {
            Ok(outcome) => {
                slot.commit();
                if outcome == StoreOutcome::SkippedExisting {
                    RunCounters::bump(&self.counters.emit_skips);
                }
                debug!(url = %record.url, target = %name, "Extracted");
                Ok(())
            }
            Err(e) => {
                drop(slot);
                warn!(url = %record.url, target = %name, error = %e, "Emit failed");
                self.truncate(&record, "emit failed").await
            }
        }
    }

    /// Fetch and unwrap the archived document, or say why it cannot be stored.
    async fn fetch_payload(
        &self,
        record: &IndexRecord,
    ) -> std::result::Result<Vec<u8>, &'static str> {
        let payload = match self
            .fetcher
            .fetch(&record.filename, record.offset, record.length)
            .await
        {
            FetchOutcome::Fetched { payload, attempts } => {
                debug!(url = %record.url, attempts, bytes = payload.len(), "Fetched record");
                payload
            }
            FetchOutcome::Failed { failure, attempts } => {
                warn!(
                    url = %record.url,
                    attempts,
                    error = %failure.error(),
                    "Fetch failed"
                );
                return Err("fetch failed");
            }
        };

        let warc = WarcRecord::decode(&payload).map_err(|e| {
            warn!(url = %record.url, error = %e, "Undecodable WARC record");
            "malformed record"
        })?;
        debug!(
            url = %record.url,
            warc_target = warc.target_uri().unwrap_or("-"),
            "Decoded WARC record"
        );
        if warc.is_truncated() {
            return Err("capped in WARC");
        }
        warc.into_payload().map_err(|e| {
            warn!(url = %record.url, error = %e, "Unreadable WARC payload");
            "malformed record"
        })
    }

    /// Count the record as truncated and log its URL.
    ///
    /// Only a failed log write is returned as an error; it ends the run.
    async fn truncate(&self, record: &IndexRecord, reason: &str) -> Result<()> {
        if !self.quota.try_count_truncated() {
            RunCounters::bump(&self.counters.dropped_over_quota);
            return Ok(());
        }

        debug!(url = %record.url, reason, "Truncated");
        self.truncated_log
            .append(&record.to_truncated())
            .await
            .map_err(|e| {
                HarvestError::storage(format!(
                    "cannot write truncated log {}: {}",
                    self.truncated_log.path().display(),
                    e
                ))
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backoff::{BackoffPolicy, RecordingSleeper};
    use crate::emitter::EmitError;
    use crate::fetcher::{FetchError, RangeFetcher};
    use crate::quota::{Ceiling, QuotaLimits};
    use crate::warc::tests::gzip_response;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Serves a WARC record per filename; names listed in `missing` fail permanently.
    struct FakeArchive {
        missing: Vec<String>,
        capped: Vec<String>,
        calls: StdMutex<Vec<String>>,
    }

    impl FakeArchive {
        fn new(missing: &[&str]) -> Self {
            Self {
                missing: missing.iter().map(|s| s.to_string()).collect(),
                capped: Vec::new(),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RangeFetcher for FakeArchive {
        async fn fetch_range(
            &self,
            location: &str,
            _: u64,
            _: u64,
        ) -> std::result::Result<Vec<u8>, FetchError> {
            self.calls.lock().unwrap().push(location.to_string());
            if self.missing.iter().any(|m| m == location) {
                return Err(FetchError::permanent("404"));
            }
            let capped = self.capped.iter().any(|c| c == location);
            Ok(gzip_response(
                &format!("https://example.com/{}", location),
                location.as_bytes(),
                capped,
            ))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    /// In-memory sink.
    #[derive(Default)]
    struct MemorySink {
        objects: StdMutex<HashMap<String, Vec<u8>>>,
        fail: bool,
    }

    #[async_trait]
    impl Emitter for MemorySink {
        async fn store(
            &self,
            name: &str,
            data: Vec<u8>,
        ) -> std::result::Result<StoreOutcome, EmitError> {
            if self.fail {
                return Err(EmitError::Storage {
                    name: name.to_string(),
                    message: "sink unreachable".to_string(),
                });
            }
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(name) {
                return Ok(StoreOutcome::SkippedExisting);
            }
            let bytes = data.len() as u64;
            objects.insert(name.to_string(), data);
            Ok(StoreOutcome::Stored { bytes })
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn records(n: usize) -> Vec<IndexRecord> {
        (0..n)
            .map(|i| {
                IndexRecord::new(format!("r{}", i), 0, 10, format!("https://example.com/r{}", i))
                    .with_digest(format!("DIGEST{:02}", i))
            })
            .collect()
    }

    async fn pipeline(
        archive: Arc<FakeArchive>,
        sink: Arc<MemorySink>,
        limits: QuotaLimits,
        dir: &TempDir,
    ) -> Pipeline {
        let fetcher = BackoffFetcher::with_sleeper(
            archive,
            BackoffPolicy::default(),
            Arc::new(RecordingSleeper::new()),
        );
        let log = TruncatedLog::open(dir.path().join("truncated.txt")).await.unwrap();
        Pipeline::new(fetcher, sink, log, Arc::new(QuotaTracker::new(limits))).with_workers(1)
    }

    fn log_lines(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("truncated.txt"))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_all_records_extracted() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&[]));
        let sink = Arc::new(MemorySink::default());

        let summary = pipeline(archive, sink.clone(), QuotaLimits::default(), &dir)
            .await
            .run(Box::new(records(4).into_iter()))
            .await
            .unwrap();

        assert_eq!(summary.records_seen, 4);
        assert_eq!(summary.files_extracted, 4);
        assert_eq!(summary.files_truncated, 0);
        assert_eq!(
            sink.objects.lock().unwrap().get("DIGEST02").map(Vec::as_slice),
            Some(b"r2".as_slice())
        );
        assert!(log_lines(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_truncated_once() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&["r1"]));
        let sink = Arc::new(MemorySink::default());

        let summary = pipeline(archive.clone(), sink, QuotaLimits::default(), &dir)
            .await
            .run(Box::new(records(3).into_iter()))
            .await
            .unwrap();

        assert_eq!(summary.files_extracted, 2);
        assert_eq!(summary.files_truncated, 1);
        assert_eq!(log_lines(&dir), vec!["https://example.com/r1"]);
        // permanent failure: one attempt only
        assert_eq!(archive.calls().iter().filter(|c| *c == "r1").count(), 1);
    }

    #[tokio::test]
    async fn test_capped_records_are_not_fetched() {
        let dir = TempDir::new().unwrap();
        let mut archive = FakeArchive::new(&[]);
        archive.capped.push("r1".to_string());
        let archive = Arc::new(archive);
        let sink = Arc::new(MemorySink::default());

        let mut input = records(3);
        input[0] = input[0].clone().with_truncated("length");

        let summary = pipeline(archive.clone(), sink, QuotaLimits::default(), &dir)
            .await
            .run(Box::new(input.into_iter()))
            .await
            .unwrap();

        // r0 capped in the index, r1 capped in the WARC header
        assert_eq!(summary.files_truncated, 2);
        assert_eq!(summary.files_extracted, 1);
        assert_eq!(archive.calls(), vec!["r1", "r2"]);
        assert_eq!(
            log_lines(&dir),
            vec!["https://example.com/r0", "https://example.com/r1"]
        );
    }

    #[tokio::test]
    async fn test_emit_failure_counts_as_truncated() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&[]));
        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });

        let summary = pipeline(archive, sink, QuotaLimits::default(), &dir)
            .await
            .run(Box::new(records(2).into_iter()))
            .await
            .unwrap();

        assert_eq!(summary.files_extracted, 0);
        assert_eq!(summary.files_truncated, 2);
        assert_eq!(log_lines(&dir).len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_skips_fetch_and_emit() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&[]));
        let sink = Arc::new(MemorySink::default());
        let limits = QuotaLimits {
            max_files_extracted: Ceiling::AtMost(2),
            ..Default::default()
        };

        let summary = pipeline(archive.clone(), sink.clone(), limits, &dir)
            .await
            .with_dry_run(true)
            .run(Box::new(records(5).into_iter()))
            .await
            .unwrap();

        assert_eq!(summary.files_extracted, 2);
        assert!(archive.calls().is_empty());
        assert!(sink.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_ceiling_stops_run() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&["r0", "r1", "r2", "r3"]));
        let sink = Arc::new(MemorySink::default());
        let limits = QuotaLimits {
            max_files_truncated: Ceiling::AtMost(2),
            ..Default::default()
        };

        let summary = pipeline(archive.clone(), sink, limits, &dir)
            .await
            .run(Box::new(records(6).into_iter()))
            .await
            .unwrap();

        assert_eq!(summary.files_truncated, 2);
        assert_eq!(log_lines(&dir).len(), 2);
        assert_eq!(archive.calls(), vec!["r0", "r1"]);
    }

    #[tokio::test]
    async fn test_record_ceiling_limits_reading() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&[]));
        let sink = Arc::new(MemorySink::default());
        let limits = QuotaLimits {
            max_records: Ceiling::AtMost(3),
            ..Default::default()
        };

        let summary = pipeline(archive, sink, limits, &dir)
            .await
            .run(Box::new(records(10).into_iter()))
            .await
            .unwrap();

        assert_eq!(summary.records_seen, 3);
        assert_eq!(summary.files_extracted, 3);
    }

    #[tokio::test]
    async fn test_summary_reports_malformed_index_lines() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("cdx-00000");
        std::fs::write(
            &index,
            "com,example)/r0 20240301120000 \
             {\"url\": \"https://example.com/r0\", \"filename\": \"r0\", \
             \"offset\": \"0\", \"length\": \"10\", \"digest\": \"DIGEST00\"}\n\
             not a cdx line\n",
        )
        .unwrap();

        let archive = Arc::new(FakeArchive::new(&[]));
        let sink = Arc::new(MemorySink::default());
        let summary = pipeline(archive, sink, QuotaLimits::default(), &dir)
            .await
            .run(Box::new(crate::index::CdxIndexReader::new(vec![index])))
            .await
            .unwrap();

        assert_eq!(summary.records_seen, 1);
        assert_eq!(summary.files_extracted, 1);
        assert_eq!(summary.malformed_index_lines, 1);
        assert!(summary.to_string().contains("malformed=1"));
    }

    struct BrokenIndex;

    impl IndexSource for BrokenIndex {
        fn next_record(&mut self) -> Option<Result<IndexRecord>> {
            Some(Err(HarvestError::index("disk on fire")))
        }
    }

    #[tokio::test]
    async fn test_unreadable_index_is_fatal() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::new(&[]));
        let sink = Arc::new(MemorySink::default());

        let err = pipeline(archive, sink, QuotaLimits::default(), &dir)
            .await
            .run(Box::new(BrokenIndex))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Index(_)));
    }
}

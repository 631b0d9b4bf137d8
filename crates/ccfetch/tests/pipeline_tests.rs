//! End-to-end pipeline tests
//!
//! Runs the full pipeline against an in-process archive, a real filesystem
//! sink and a real truncated log.

mod common;

use ccfetch::backoff::{BackoffPolicy, RecordingSleeper};
use ccfetch::config::DEFAULT_NUM_THREADS;
use ccfetch::emitter::{FileSystemEmitter, OnExists};
use ccfetch::fetcher::BackoffFetcher;
use ccfetch::quota::{Ceiling, QuotaLimits, QuotaTracker};
use ccfetch::rewriter::DigestPathRewriter;
use ccfetch::selector::{FieldSelector, SelectorConfig};
use ccfetch::truncated::TruncatedLog;
use ccfetch::Pipeline;
use common::{records, FakeArchive};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn build(
    archive: Arc<FakeArchive>,
    dir: &Path,
    limits: QuotaLimits,
    workers: usize,
) -> Pipeline {
    let fetcher = BackoffFetcher::with_sleeper(
        archive,
        BackoffPolicy::default(),
        Arc::new(RecordingSleeper::new()),
    );
    let emitter = Arc::new(FileSystemEmitter::new(dir.join("docs"), OnExists::Skip));
    let log = TruncatedLog::open(dir.join("truncated.txt")).await.unwrap();

    Pipeline::new(fetcher, emitter, log, Arc::new(QuotaTracker::new(limits))).with_workers(workers)
}

fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

fn log_lines(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("truncated.txt"))
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

/// Ten records: two unfetchable, one rejected by the selector, extraction
/// capped at five, default worker count.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_extraction_ceiling_end_to_end() {
    let dir = TempDir::new().unwrap();
    let archive = Arc::new(FakeArchive::new(&[
        "crawl-data/doc-1.warc.gz",
        "crawl-data/doc-4.warc.gz",
    ]));

    let mut input = records(10);
    input[2].mime = Some("text/html".to_string());

    let selector: SelectorConfig =
        serde_json::from_str(r#"{"must": {"mime": [{"match": "application/pdf"}]}}"#).unwrap();
    let limits = QuotaLimits {
        max_files_extracted: Ceiling::AtMost(5),
        ..Default::default()
    };

    let summary = build(archive.clone(), dir.path(), limits, DEFAULT_NUM_THREADS)
        .await
        .with_selector(Arc::new(FieldSelector::compile(&selector).unwrap()))
        .with_rewriter(Arc::new(DigestPathRewriter::new("xx/")))
        .run(Box::new(input.into_iter()))
        .await
        .unwrap();

    assert_eq!(summary.files_extracted, 5);
    assert_eq!(summary.files_truncated, 2);
    assert_eq!(summary.skipped_by_selector, 1);
    assert!(summary.files_extracted + summary.files_truncated <= summary.records_seen);

    // doc-8 and doc-9 were never attempted
    let calls = archive.calls();
    assert_eq!(calls.len(), 7, "{:?}", calls);
    assert!(!calls.iter().any(|c| c.contains("doc-8") || c.contains("doc-9")));
    assert!(!calls.iter().any(|c| c.contains("doc-2")));

    // two workers may append in either order
    let mut logged = log_lines(dir.path());
    logged.sort();
    assert_eq!(
        logged,
        vec!["https://example.com/doc-1.pdf", "https://example.com/doc-4.pdf"]
    );
    assert_eq!(count_files(&dir.path().join("docs")), 5);
    assert_eq!(
        std::fs::read(dir.path().join("docs/D0/D00XYZ")).unwrap(),
        b"crawl-data/doc-0.warc.gz"
    );
}

#[tokio::test]
async fn test_exhausted_retries_truncate_once() {
    let dir = TempDir::new().unwrap();
    let archive = Arc::new(
        FakeArchive::new(&[]).with_throttled(&["crawl-data/doc-1.warc.gz"]),
    );
    let sleeper = RecordingSleeper::new();
    let fetcher = BackoffFetcher::with_sleeper(
        archive.clone(),
        BackoffPolicy::default(),
        Arc::new(sleeper.clone()),
    );
    let emitter = Arc::new(FileSystemEmitter::new(dir.path().join("docs"), OnExists::Skip));
    let log = TruncatedLog::open(dir.path().join("truncated.txt")).await.unwrap();

    let summary = Pipeline::new(fetcher, emitter, log, Arc::new(QuotaTracker::unbounded()))
        .with_workers(DEFAULT_NUM_THREADS)
        .run(Box::new(records(3).into_iter()))
        .await
        .unwrap();

    assert_eq!(summary.files_extracted, 2);
    assert_eq!(summary.files_truncated, 1);
    assert_eq!(log_lines(dir.path()), vec!["https://example.com/doc-1.pdf"]);

    // every scheduled wait was used before giving up
    assert_eq!(
        sleeper.waits(),
        [30, 120, 600, 1800].map(Duration::from_secs).to_vec()
    );
    let attempts = archive
        .calls()
        .iter()
        .filter(|c| c.as_str() == "crawl-data/doc-1.warc.gz")
        .count();
    assert_eq!(attempts, 5);
    assert_eq!(count_files(&dir.path().join("docs")), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_respect_ceilings() {
    let dir = TempDir::new().unwrap();
    let missing: Vec<String> = (0..40)
        .filter(|i| i % 3 == 0)
        .map(|i| format!("crawl-data/doc-{}.warc.gz", i))
        .collect();
    let missing: Vec<&str> = missing.iter().map(String::as_str).collect();
    let archive = Arc::new(FakeArchive::new(&missing));

    let limits = QuotaLimits {
        max_records: Ceiling::Unbounded,
        max_files_extracted: Ceiling::AtMost(12),
        max_files_truncated: Ceiling::AtMost(7),
    };

    let summary = build(archive, dir.path(), limits, 8)
        .await
        .run(Box::new(records(40).into_iter()))
        .await
        .unwrap();

    assert!(summary.files_extracted <= 12);
    assert!(summary.files_truncated <= 7);
    assert!(summary.files_extracted + summary.files_truncated <= summary.records_seen);
    assert_eq!(count_files(&dir.path().join("docs")) as u64, summary.files_extracted);
    assert_eq!(log_lines(dir.path()).len() as u64, summary.files_truncated);
}

#[tokio::test]
async fn test_rerun_skips_existing_documents() {
    let dir = TempDir::new().unwrap();
    let archive = Arc::new(FakeArchive::new(&[]));

    let first = build(archive.clone(), dir.path(), QuotaLimits::default(), 2)
        .await
        .run(Box::new(records(3).into_iter()))
        .await
        .unwrap();
    assert_eq!(first.emit_skips, 0);

    let second = build(archive, dir.path(), QuotaLimits::default(), 2)
        .await
        .run(Box::new(records(3).into_iter()))
        .await
        .unwrap();
    assert_eq!(second.files_extracted, 3);
    assert_eq!(second.emit_skips, 3);
    assert_eq!(count_files(&dir.path().join("docs")), 3);
}

#[tokio::test]
async fn test_selector_rejections_are_quota_neutral() {
    let dir = TempDir::new().unwrap();
    let archive = Arc::new(FakeArchive::new(&[]));

    let selector: SelectorConfig =
        serde_json::from_str(r#"{"must": {"mime": [{"match": "video/mp4"}]}}"#).unwrap();

    let summary = build(archive.clone(), dir.path(), QuotaLimits::default(), 2)
        .await
        .with_selector(Arc::new(FieldSelector::compile(&selector).unwrap()))
        .run(Box::new(records(6).into_iter()))
        .await
        .unwrap();

    assert_eq!(summary.records_seen, 6);
    assert_eq!(summary.skipped_by_selector, 6);
    assert_eq!(summary.files_extracted, 0);
    assert_eq!(summary.files_truncated, 0);
    assert!(archive.calls().is_empty());
    assert!(log_lines(dir.path()).is_empty());
}

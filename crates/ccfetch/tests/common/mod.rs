//! Shared helpers for ccfetch integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ccfetch::fetcher::{FetchError, RangeFetcher};
use ccfetch::IndexRecord;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Mutex;

/// Gzip-compressed WARC response record wrapping `body`.
pub fn warc_response(url: &str, body: &[u8]) -> Vec<u8> {
    let mut http = b"HTTP/1.1 200 OK\r\nContent-Type: application/pdf\r\n\r\n".to_vec();
    http.extend_from_slice(body);

    let mut record = format!(
        "WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: {}\r\nContent-Length: {}\r\n\r\n",
        url,
        http.len()
    )
    .into_bytes();
    record.extend_from_slice(&http);
    record.extend_from_slice(b"\r\n\r\n");

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&record).unwrap();
    encoder.finish().unwrap()
}

/// Records `doc-0 .. doc-{n-1}`, each with its own container and digest.
pub fn records(n: usize) -> Vec<IndexRecord> {
    (0..n)
        .map(|i| {
            IndexRecord::new(
                format!("crawl-data/doc-{}.warc.gz", i),
                0,
                100,
                format!("https://example.com/doc-{}.pdf", i),
            )
            .with_digest(format!("D{:02}XYZ", i))
            .with_mime("application/pdf")
        })
        .collect()
}

/// In-process archive: answers every location with a WARC record whose body
/// is the location, except locations marked missing (permanent failure) or
/// throttled (transient failure on every attempt).
pub struct FakeArchive {
    missing: HashSet<String>,
    throttled: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeArchive {
    pub fn new(missing: &[&str]) -> Self {
        Self {
            missing: missing.iter().map(|s| s.to_string()).collect(),
            throttled: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_throttled(mut self, throttled: &[&str]) -> Self {
        self.throttled = throttled.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeFetcher for FakeArchive {
    async fn fetch_range(
        &self,
        location: &str,
        _start: u64,
        _length: u64,
    ) -> Result<Vec<u8>, FetchError> {
        self.calls.lock().unwrap().push(location.to_string());
        // let other workers interleave
        tokio::task::yield_now().await;

        if self.missing.contains(location) {
            return Err(FetchError::permanent("HTTP 404"));
        }
        if self.throttled.contains(location) {
            return Err(FetchError::transient("HTTP 503 Slow Down"));
        }
        Ok(warc_response(
            &format!("https://example.com/{}", location),
            location.as_bytes(),
        ))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

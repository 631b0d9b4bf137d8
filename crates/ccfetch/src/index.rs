//! Index sources
//!
//! The pipeline consumes records through [`IndexSource`], a blocking, ordered,
//! finite stream. [`CdxIndexReader`] reads Common Crawl CDX files, where each
//! line is `<surt-key> <timestamp> <json>`. Gzip files are read member by
//! member, since the published shards are concatenated gzip streams.

use ccfetch_common::{HarvestError, Result};
use flate2::read::MultiGzDecoder;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::record::IndexRecord;

/// Ordered stream of index records.
///
/// `None` ends the stream. An `Err` means the source itself is unusable and
/// stops the run.
pub trait IndexSource: Send {
    fn next_record(&mut self) -> Option<Result<IndexRecord>>;

    /// Entries skipped so far because they could not be parsed.
    fn malformed_lines(&self) -> u64 {
        0
    }
}

impl IndexSource for std::vec::IntoIter<IndexRecord> {
    fn next_record(&mut self) -> Option<Result<IndexRecord>> {
        self.next().map(Ok)
    }
}

struct OpenIndex {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    line_no: u64,
}

/// Reads CDX index files one after another.
pub struct CdxIndexReader {
    pending: VecDeque<PathBuf>,
    current: Option<OpenIndex>,
    malformed: u64,
}

impl CdxIndexReader {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pending: paths.into_iter().collect(),
            current: None,
            malformed: 0,
        }
    }

    fn open(path: &Path) -> Result<Box<dyn BufRead + Send>> {
        let file = File::open(path).map_err(|e| {
            HarvestError::index(format!("cannot open index {}: {}", path.display(), e))
        })?;

        let gzipped = path.extension().is_some_and(|ext| ext == "gz");
        Ok(if gzipped {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        })
    }
}

impl IndexSource for CdxIndexReader {
    fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    fn next_record(&mut self) -> Option<Result<IndexRecord>> {
        loop {
            if self.current.is_none() {
                let path = self.pending.pop_front()?;
                info!(path = %path.display(), "Reading index file");
                match Self::open(&path) {
                    Ok(reader) => {
                        self.current = Some(OpenIndex {
                            path,
                            reader,
                            line_no: 0,
                        })
                    }
                    Err(e) => return Some(Err(e)),
                }
            }

            let index = self.current.as_mut()?;
            let mut line = String::new();
            match index.reader.read_line(&mut line) {
                Ok(0) => {
                    debug!(path = %index.path.display(), lines = index.line_no, "Index file done");
                    self.current = None;
                }
                Ok(_) => {
                    index.line_no += 1;
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_cdx_line(line) {
                        Ok(record) => return Some(Ok(record)),
                        Err(reason) => {
                            self.malformed += 1;
                            warn!(
                                path = %index.path.display(),
                                line = index.line_no,
                                reason = %reason,
                                "Skipping malformed index line"
                            );
                        }
                    }
                }
                Err(e) => {
                    let err = HarvestError::index(format!(
                        "failed reading {} at line {}: {}",
                        index.path.display(),
                        index.line_no + 1,
                        e
                    ));
                    self.current = None;
                    self.pending.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Parse `<surt-key> <timestamp> <json>`; a bare JSON object is also accepted.
pub fn parse_cdx_line(line: &str) -> std::result::Result<IndexRecord, String> {
    if line.starts_with('{') {
        return serde_json::from_str(line).map_err(|e| e.to_string());
    }

    let mut parts = line.splitn(3, ' ');
    let (_surt, timestamp, json) = match (parts.next(), parts.next(), parts.next()) {
        (Some(surt), Some(ts), Some(json)) => (surt, ts, json),
        _ => return Err("expected '<surt> <timestamp> <json>'".to_string()),
    };

    let mut record: IndexRecord = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if record.timestamp.is_none() {
        record.timestamp = Some(timestamp.to_string());
    }
    Ok(record)
}

//! Index record types
//!
//! An [`IndexRecord`] names one archived object: the WARC container it lives
//! in, the byte range of its compressed record, and the URL it was captured
//! from. The JSON shape matches the Common Crawl CDX index, where numeric
//! fields are written as strings.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One archived object listed in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexRecord {
    /// WARC container path, relative to the crawl root
    pub filename: String,

    /// Byte offset of the gzip member inside the container
    #[serde(deserialize_with = "u64_from_str_or_int")]
    pub offset: u64,

    /// Length in bytes of the gzip member
    #[serde(deserialize_with = "u64_from_str_or_int")]
    pub length: u64,

    /// Captured URL
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_detected: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Base32 SHA-1 of the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,

    /// Reason the crawler cut the payload short ("length", "time", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<String>,

    /// Capture timestamp, taken from the CDX line prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl IndexRecord {
    /// Minimal record, mostly useful for tests and synthetic sources.
    pub fn new(
        filename: impl Into<String>,
        offset: u64,
        length: u64,
        url: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            offset,
            length,
            url: url.into(),
            mime: None,
            mime_detected: None,
            status: None,
            digest: None,
            languages: None,
            charset: None,
            truncated: None,
            timestamp: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_truncated(mut self, reason: impl Into<String>) -> Self {
        self.truncated = Some(reason.into());
        self
    }

    /// Whether the crawler marked the payload as cut short.
    pub fn is_capped(&self) -> bool {
        self.truncated
            .as_deref()
            .is_some_and(|reason| !reason.trim().is_empty())
    }

    /// Identifying subset written to the truncated log.
    pub fn to_truncated(&self) -> TruncatedRecord {
        TruncatedRecord {
            url: self.url.clone(),
        }
    }
}

/// Entry in the truncated-records log: the source URL, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedRecord {
    pub url: String,
}

impl fmt::Display for TruncatedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Embedded line breaks would split one entry into two.
        let line: String = self
            .url
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        write!(f, "{}", line)
    }
}

fn u64_from_str_or_int<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

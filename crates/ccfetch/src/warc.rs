//! WARC record decoding
//!
//! A ranged read of a Common Crawl container yields exactly one gzip member
//! holding one WARC record. For `response` records the stored document is the
//! HTTP body, after the captured status line and headers.

use flate2::read::GzDecoder;
use std::io::Read;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarcError {
    #[error("failed to decompress WARC record: {0}")]
    Decompress(String),

    #[error("malformed WARC record: {0}")]
    Malformed(String),
}

/// One parsed WARC record.
#[derive(Debug, Clone)]
pub struct WarcRecord {
    headers: Vec<(String, String)>,
    block: Vec<u8>,
}

impl WarcRecord {
    /// Decode a record from its (usually gzip-compressed) bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, WarcError> {
        if raw.starts_with(&GZIP_MAGIC) {
            let mut inflated = Vec::with_capacity(raw.len() * 4);
            GzDecoder::new(raw)
                .read_to_end(&mut inflated)
                .map_err(|e| WarcError::Decompress(e.to_string()))?;
            Self::parse(&inflated)
        } else {
            Self::parse(raw)
        }
    }

    /// Parse an uncompressed record.
    pub fn parse(data: &[u8]) -> Result<Self, WarcError> {
        let (head, rest) = split_head(data)
            .ok_or_else(|| WarcError::Malformed("no end of header block".to_string()))?;

        let head = std::str::from_utf8(head)
            .map_err(|_| WarcError::Malformed("header block is not UTF-8".to_string()))?;
        let mut lines = head.lines();

        if !lines
            .next()
            .is_some_and(|line| line.trim().starts_with("WARC/"))
        {
            return Err(WarcError::Malformed("missing WARC version line".to_string()));
        }

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let record = Self {
            headers,
            block: Vec::new(),
        };

        let length: usize = record
            .header("Content-Length")
            .ok_or_else(|| WarcError::Malformed("missing Content-Length".to_string()))?
            .parse()
            .map_err(|_| WarcError::Malformed("invalid Content-Length".to_string()))?;

        if rest.len() < length {
            return Err(WarcError::Malformed(format!(
                "block shorter than Content-Length ({} < {})",
                rest.len(),
                length
            )));
        }

        Ok(Self {
            block: rest[..length].to_vec(),
            ..record
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn record_type(&self) -> Option<&str> {
        self.header("WARC-Type")
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.header("WARC-Target-URI")
    }

    /// Whether the crawler cut this record short.
    pub fn is_truncated(&self) -> bool {
        self.header("WARC-Truncated").is_some()
    }

    /// The archived document: the HTTP body for responses, the block otherwise.
    pub fn payload(&self) -> Result<&[u8], WarcError> {
        if !self
            .record_type()
            .is_some_and(|t| t.eq_ignore_ascii_case("response"))
        {
            return Ok(&self.block);
        }

        split_head(&self.block)
            .map(|(_, body)| body)
            .ok_or_else(|| {
                WarcError::Malformed("HTTP response has no header terminator".to_string())
            })
    }

    pub fn into_payload(self) -> Result<Vec<u8>, WarcError> {
        let payload = self.payload()?;
        if payload.len() == self.block.len() {
            Ok(self.block)
        } else {
            Ok(payload.to_vec())
        }
    }
}

/// Split at the first blank line, accepting CRLF or bare LF.
fn split_head(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        return Some((&data[..pos], &data[pos + 4..]));
    }
    find(data, b"\n\n").map(|pos| (&data[..pos], &data[pos + 2..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

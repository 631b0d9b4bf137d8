//! Direct HTTPS backend
//!
//! Issues a `Range` GET against `<base_url>/<location>`. Common Crawl answers
//! with `503 Slow Down` when it throttles, which maps to a transient failure.

use async_trait::async_trait;
use ccfetch_common::{HarvestError, Result};
use reqwest::header::RANGE;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{classify_status, expect_length, range_header, FetchError, RangeFetcher};

/// Public HTTPS endpoint for Common Crawl data
pub const CC_HTTPS_BASE: &str = "https://data.commoncrawl.org";

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const USER_AGENT: &str = concat!("ccfetch/", env!("CARGO_PKG_VERSION"));

pub struct HttpRangeFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRangeFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HarvestError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, location: &str) -> String {
        format!("{}/{}", self.base_url, location.trim_start_matches('/'))
    }
}

fn classify_request_error(err: &reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::permanent(format!("invalid request: {}", err))
    } else {
        // timeouts, refused connections, resets and body errors
        FetchError::transient(err.to_string())
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    #[instrument(skip(self), fields(backend = "http"))]
    async fn fetch_range(
        &self,
        location: &str,
        start: u64,
        length: u64,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let range = range_header(start, length)?;
        let url = self.url_for(location);

        let response = self
            .client
            .get(&url)
            .header(RANGE, range)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status().as_u16();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }
        if status != 206 {
            // A 200 carries the whole container, not the record.
            return Err(FetchError::permanent(format!(
                "range not honoured: HTTP {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(&e))?;

        debug!(url = %url, bytes = body.len(), "Ranged fetch complete");

        expect_length(body.to_vec(), length)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

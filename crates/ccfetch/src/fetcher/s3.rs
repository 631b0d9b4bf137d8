//! Object-storage backend
//!
//! Reads the record with a ranged `GetObject` against the public Common Crawl
//! bucket, authenticated through a named AWS credentials profile.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Region,
    error::{ProvideErrorMetadata, SdkError},
    operation::get_object::GetObjectError,
    Client,
};
use tracing::{debug, info, instrument};

use super::{expect_length, range_header, FetchError, RangeFetcher};

/// Bucket holding Common Crawl data
pub const CC_S3_BUCKET: &str = "commoncrawl";

/// Region of the Common Crawl bucket
pub const CC_REGION: &str = "us-east-1";

// S3 error codes that mean "try again later"
const RETRYABLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

#[derive(Clone)]
pub struct S3RangeFetcher {
    client: Client,
    bucket: String,
}

impl S3RangeFetcher {
    /// Build a client from a named credentials profile.
    pub async fn new(profile: &str, bucket: impl Into<String>, region: impl Into<String>) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .profile_name(profile)
            .region(Region::new(region.into()))
            .load()
            .await;

        let bucket = bucket.into();
        info!(profile = %profile, bucket = %bucket, "S3 fetch client initialized");

        Self {
            client: Client::new(&sdk_config),
            bucket,
        }
    }

    /// Use an already configured client, e.g. one pointed at MinIO.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn classify_sdk_error<R>(err: &SdkError<GetObjectError, R>) -> FetchError
where
    R: std::fmt::Debug,
{
    match err {
        SdkError::ConstructionFailure(_) => {
            FetchError::permanent(format!("request construction failed: {:?}", err))
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            FetchError::transient(format!("{:?}", err))
        }
        SdkError::ServiceError(ctx) => classify_service_error(ctx.err()),
        _ => FetchError::transient(format!("{:?}", err)),
    }
}

fn classify_service_error(err: &GetObjectError) -> FetchError {
    if let GetObjectError::NoSuchKey(_) = err {
        return FetchError::permanent("no such key");
    }

    let code = err.code().unwrap_or("Unknown");
    let message = err.message().unwrap_or_default();
    if RETRYABLE_CODES.contains(&code) {
        FetchError::transient(format!("{}: {}", code, message))
    } else {
        FetchError::permanent(format!("{}: {}", code, message))
    }
}

#[async_trait]
impl RangeFetcher for S3RangeFetcher {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn fetch_range(
        &self,
        location: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, FetchError> {
        let range = range_header(start, length)?;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(location.trim_start_matches('/'))
            .range(range)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| FetchError::transient(format!("failed to read S3 body: {}", e)))?
            .into_bytes()
            .to_vec();

        debug!(key = %location, bytes = data.len(), "Ranged S3 read complete");

        expect_length(data, length)
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

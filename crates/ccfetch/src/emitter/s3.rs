//! S3 sink
//!
//! Objects are written with a conditional put, so under `skip` two runs
//! racing on the same key store it once and the loser reports the key as
//! existing.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Region,
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};

use super::{validate_name, EmitError, Emitter, OnExists, StoreOutcome};

/// Region used when the sink does not name one
pub const DEFAULT_SINK_REGION: &str = "us-east-1";

/// Connection settings for an S3 sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3SinkSettings {
    pub profile: String,
    pub bucket: String,
    pub region: String,
    pub prefix: Option<String>,
    /// Custom endpoint, e.g. MinIO; implies path-style addressing
    pub endpoint: Option<String>,
}

#[derive(Clone)]
pub struct S3Emitter {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    on_exists: OnExists,
}

impl S3Emitter {
    pub async fn new(settings: S3SinkSettings, on_exists: OnExists) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .profile_name(&settings.profile)
            .region(Region::new(settings.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!(
            profile = %settings.profile,
            bucket = %settings.bucket,
            region = %settings.region,
            "S3 sink client initialized"
        );

        Self::from_client(
            Client::from_conf(builder.build()),
            settings.bucket,
            settings.prefix,
            on_exists,
        )
    }

    pub fn from_client(
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
        on_exists: OnExists,
    ) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            client,
            bucket: bucket.into(),
            prefix,
            on_exists,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key for a target name.
    pub fn key_for(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name.to_string(),
        }
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, EmitError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(false),
            Err(e) => Err(EmitError::Storage {
                name: key.to_string(),
                message: format!("failed to check object existence: {}", e),
            }),
        }
    }
}

#[async_trait]
impl Emitter for S3Emitter {
    #[instrument(skip(self, data), fields(bucket = %self.bucket, bytes = data.len()))]
    async fn store(&self, name: &str, data: Vec<u8>) -> Result<StoreOutcome, EmitError> {
        validate_name(name)?;
        let key = self.key_for(name);

        let exclusive = self.on_exists != OnExists::Replace;
        if exclusive && self.exists(&key).await? {
            return match self.on_exists {
                OnExists::Error => Err(EmitError::AlreadyExists(key)),
                _ => {
                    debug!(key = %key, "Object exists, skipping");
                    Ok(StoreOutcome::SkippedExisting)
                }
            };
        }

        let bytes = data.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data));

        // A concurrent writer can win between the HEAD and the PUT.
        if exclusive {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => {
                debug!(key = %key, bytes, "Uploaded object");
                Ok(StoreOutcome::Stored { bytes })
            }
            Err(SdkError::ServiceError(ctx)) if ctx.err().code() == Some("PreconditionFailed") => {
                match self.on_exists {
                    OnExists::Error => Err(EmitError::AlreadyExists(key)),
                    _ => Ok(StoreOutcome::SkippedExisting),
                }
            }
            Err(e) => Err(EmitError::Storage {
                name: key,
                message: format!("failed to upload: {}", e),
            }),
        }
    }

    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }
}

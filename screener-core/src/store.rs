use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use thiserror::Error;
use tracing::debug;

use crate::config::ObjectStoreSection;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store rejected credentials: {0}")]
    Credentials(String),
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("failed to presign request: {0}")]
    Presign(String),
}

/// Metadata returned by a HEAD request against the store.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

/// Thin wrapper around an S3-compatible object store. Issues signed GET
/// URLs and HEAD metadata; all byte transfer happens over plain HTTP in the
/// source cache.
#[derive(Clone)]
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    url_ttl: Duration,
}

impl ObjectStore {
    pub async fn new(section: &ObjectStoreSection) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .region(aws_sdk_s3::config::Region::new(section.region.clone()))
            .force_path_style(section.force_path_style);
        if let Some(endpoint) = &section.endpoint {
            if !endpoint.is_empty() {
                builder = builder.endpoint_url(endpoint);
            }
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: section.bucket.clone(),
            url_ttl: Duration::from_secs(section.url_ttl_seconds),
        }
    }

    pub async fn head(&self, key: &str) -> StoreResult<ObjectHead> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_sdk_error(key, &err))?;
        Ok(ObjectHead {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().map(String::from),
            etag: response.e_tag().map(String::from),
        })
    }

    /// Presigned GET URL, valid for the configured TTL (1 hour by default).
    pub async fn signed_url(&self, key: &str) -> StoreResult<String> {
        let presigning = PresigningConfig::expires_in(self.url_ttl)
            .map_err(|err| StoreError::Presign(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| classify_sdk_error(key, &err))?;
        debug!(key = %key, ttl = ?self.url_ttl, "issued signed url");
        Ok(request.uri().to_string())
    }
}

fn classify_sdk_error<E, R>(key: &str, err: &aws_sdk_s3::error::SdkError<E, R>) -> StoreError
where
    E: aws_sdk_s3::error::ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    use aws_sdk_s3::error::ProvideErrorMetadata;

    match err.code() {
        Some("NotFound") | Some("NoSuchKey") => StoreError::NotFound(key.to_string()),
        Some("AccessDenied")
        | Some("InvalidAccessKeyId")
        | Some("SignatureDoesNotMatch")
        | Some("ExpiredToken") => StoreError::Credentials(err.to_string()),
        _ => StoreError::Request(err.to_string()),
    }
}

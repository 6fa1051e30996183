//! Object storage for model inputs and G-code outputs.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Get and put of whole objects in a single bucket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Downloads an object. A missing key is [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Uploads an object, overwriting whatever is at `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()>;
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, R2). `None` means AWS.
    pub endpoint_url: Option<String>,
    /// Static `(access_key_id, secret_access_key)`. `None` uses the default
    /// AWS credential chain.
    pub credentials: Option<(String, String)>,
}

/// S3 implementation of [`ObjectStore`].
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> StoreResult<Self> {
        if config.bucket.is_empty() {
            return Err(StoreError::Config("bucket name is empty".to_string()));
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region));
        if let Some((access_key_id, secret_access_key)) = config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "slicer-worker",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        })
    }

    /// Check connectivity to the bucket by performing a head bucket operation.
    pub async fn check_connectivity(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StoreError::transport(format!(
                    "head bucket {} failed: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        info!("Object store reachable: bucket={}", self.bucket);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        debug!("Downloading {}", key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => StoreError::not_found(key),
                _ => StoreError::transport(DisplayErrorContext(&e).to_string()),
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transport(e.to_string()))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} ({} bytes)", key, bytes.len());
        Ok(bytes)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        debug!("Uploading {} bytes to {}", bytes.len(), key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StoreError::transport(DisplayErrorContext(&e).to_string()))?;

        info!("Uploaded {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_bucket_is_rejected() {
        let result = S3ObjectStore::new(S3Config {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            credentials: None,
        })
        .await;

        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_builds_with_custom_endpoint() {
        let store = S3ObjectStore::new(S3Config {
            bucket: "models".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some("http://127.0.0.1:9000".to_string()),
            credentials: Some(("minio".to_string(), "minio123".to_string())),
        })
        .await;

        assert!(store.is_ok());
    }
}

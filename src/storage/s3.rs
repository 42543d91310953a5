//! MinIO/S3 artifact store
//!
//! Blobs live in a single bucket as `<bucket>/<key>` objects.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use super::{validate_key, ArtifactStore, Bucket, StoreError};

/// S3/MinIO storage client
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Create a new storage client from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("MINIO_PORT").unwrap_or_else(|_| "9000".into());
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "grader-storage".into());
        let use_ssl = std::env::var("MINIO_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to MinIO at {}", endpoint_url);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let client = Client::from_conf(config);

        Ok(Self { client, bucket })
    }

    fn object_key(bucket: Bucket, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        Ok(format!("{}/{}", bucket.as_str(), key))
    }
}

fn backend_error(context: &str, key: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{} {}: {}", context, key, err))
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn stat(&self, bucket: Bucket, key: &str) -> Result<SystemTime, StoreError> {
        let object_key = Self::object_key(bucket, key)?;
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;

        match response {
            Ok(output) => {
                let modified = output
                    .last_modified()
                    .ok_or_else(|| backend_error("Missing Last-Modified for", &object_key, "header absent"))?;
                let secs = u64::try_from(modified.secs())
                    .map_err(|e| backend_error("Invalid Last-Modified for", &object_key, e))?;
                Ok(UNIX_EPOCH + Duration::new(secs, modified.subsec_nanos()))
            }
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Err(StoreError::NotFound {
                        bucket,
                        key: key.to_string(),
                    })
                } else {
                    Err(backend_error("Failed to stat", &object_key, err))
                }
            }
        }
    }

    async fn read(&self, bucket: Bucket, key: &str) -> Result<Vec<u8>, StoreError> {
        let object_key = Self::object_key(bucket, key)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                return if not_found {
                    Err(StoreError::NotFound {
                        bucket,
                        key: key.to_string(),
                    })
                } else {
                    Err(backend_error("Failed to download", &object_key, err))
                };
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| backend_error("Failed to read body of", &object_key, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn write(&self, bucket: Bucket, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let object_key = Self::object_key(bucket, key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| backend_error("Failed to upload", &object_key, e))?;

        debug!("Uploaded {} bytes to {}", data.len(), object_key);
        Ok(())
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StoreError> {
        let object_key = Self::object_key(bucket, key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| backend_error("Failed to delete", &object_key, e))?;
        Ok(())
    }
}

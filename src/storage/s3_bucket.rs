use anyhow::{bail, Context, Result};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;

use super::BucketBackend;
use crate::config::StorageConfig;

/// Bucket on an S3-compatible server (MinIO and friends), path-style addressing.
pub struct S3Bucket {
    bucket: Box<Bucket>,
}

impl S3Bucket {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let region = Region::Custom {
            region: "us-east-1".to_string(),
            endpoint: config.url.trim_end_matches('/').to_string(),
        };
        let credentials = Credentials::new(
            Some(&config.username),
            Some(&config.password),
            None,
            None,
            None,
        )
        .context("Failed to build object storage credentials")?;
        let bucket = Bucket::new(&config.bucket_name, region, credentials)
            .context("Failed to configure object storage bucket")?
            .with_path_style();
        if !config.crt.is_empty() {
            log::warn!("STORAGE_SERVER_CRT is set but custom CA certificates are not supported; using system roots");
        }
        Ok(Self { bucket })
    }
}

#[async_trait::async_trait]
impl BucketBackend for S3Bucket {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let response = self
            .bucket
            .put_object(key, data)
            .await
            .with_context(|| format!("Failed to put object {}", key))?;
        if !(200..300).contains(&response.status_code()) {
            bail!("Put of {} returned status {}", key, response.status_code());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .with_context(|| format!("Failed to get object {}", key))?;
        match response.status_code() {
            404 => Ok(None),
            200..=299 => Ok(Some(response.bytes().to_vec())),
            status => bail!("Get of {} returned status {}", key, status),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .with_context(|| format!("Failed to delete object {}", key))?;
        match response.status_code() {
            200..=299 | 404 => Ok(()),
            status => bail!("Delete of {} returned status {}", key, status),
        }
    }
}

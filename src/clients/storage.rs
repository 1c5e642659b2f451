use std::time::Duration;

use async_trait::async_trait;

use crate::error::ServiceError;

/// Error type for blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage rejected upload ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<BlobError> for ServiceError {
    fn from(err: BlobError) -> Self {
        ServiceError::dependency("storage", err)
    }
}

/// One object to write.
#[derive(Debug, Clone)]
pub struct PutObject<'a> {
    pub bucket: &'a str,
    pub path: &'a str,
    pub bytes: Vec<u8>,
    pub content_type: &'a str,
    pub cache_control: &'a str,
}

/// Bucketed object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes one object; a failed call leaves nothing behind.
    async fn put_object(&self, object: PutObject<'_>) -> Result<(), BlobError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// REST client for the hosted storage API (`/storage/v1/object/...`).
#[derive(Clone)]
pub struct StorageClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl StorageClient {
    pub fn new(base_url: &str, service_key: String, timeout: Duration) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            service_key,
        })
    }
}

#[async_trait]
impl BlobStore for StorageClient {
    async fn put_object(&self, object: PutObject<'_>) -> Result<(), BlobError> {
        let url = format!("{}/object/{}/{}", self.base_url, object.bucket, object.path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header(reqwest::header::CONTENT_TYPE, object.content_type)
            .header(reqwest::header::CACHE_CONTROL, format!("max-age={}", object.cache_control))
            .header("x-upsert", "false")
            .body(object.bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(BlobError::Rejected { status, message });
        }

        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/object/public/{}/{}", self.base_url, bucket, path)
    }
}

fn normalize_base_url(value: &str) -> String {
    let trimmed = value.trim_end_matches('/');
    if trimmed.ends_with("/storage/v1") {
        trimmed.to_string()
    } else {
        format!("{}/storage/v1", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_storage_prefix_once() {
        assert_eq!(
            normalize_base_url("https://store.example.com/"),
            "https://store.example.com/storage/v1"
        );
        assert_eq!(
            normalize_base_url("https://store.example.com/storage/v1"),
            "https://store.example.com/storage/v1"
        );
    }

    #[test]
    fn public_url_points_at_public_object_route() {
        let client =
            StorageClient::new("https://store.example.com", "key".into(), Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.public_url("pharmacy-documents", "u1/pharmacy/license_1_abc.pdf"),
            "https://store.example.com/storage/v1/object/public/pharmacy-documents/u1/pharmacy/license_1_abc.pdf"
        );
    }
}

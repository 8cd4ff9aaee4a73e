use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use crate::core::{AuthorizationProvider, FileCategory, FileHandle, Result, UploadDestination, UploaderError};
use crate::utils::{RetryBuilder, RetryStrategy};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignRequest<'a> {
    filename: &'a str,
    content_type: &'a str,
    size: u64,
    category: FileCategory,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    url: Url,
    key: String,
    expires_in: u64,
}

/// Asks an HTTP endpoint for a presigned upload destination.
#[derive(Debug, Clone)]
pub struct HttpAuthorizationProvider {
    client: Client,
    endpoint: Url,
    credentials: Option<String>,
    max_attempts: u32,
    backoff: RetryStrategy,
}

impl HttpAuthorizationProvider {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            credentials: None,
            max_attempts: 3,
            backoff: RetryStrategy::Exponential {
                initial: Duration::from_millis(500),
                multiplier: 2.0,
                max_delay: Duration::from_secs(10),
            },
        })
    }

    /// Sent as a bearer token.
    pub fn credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff: RetryStrategy) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    async fn request_once(&self, file: &FileHandle, category: FileCategory) -> Result<UploadDestination> {
        let body = PresignRequest {
            filename: file.name(),
            content_type: file.mime_type(),
            size: file.size(),
            category,
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(credentials) = &self.credentials {
            request = request.bearer_auth(credentials);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploaderError::authorization(status.as_u16(), message));
        }

        let presign: PresignResponse = response.json().await?;
        Ok(UploadDestination {
            url: presign.url,
            key: presign.key,
            expires_in_seconds: presign.expires_in,
        })
    }
}

#[async_trait]
impl AuthorizationProvider for HttpAuthorizationProvider {
    async fn get_upload_destination(&self, file: &FileHandle, category: FileCategory) -> Result<UploadDestination> {
        let destination = RetryBuilder::new()
            .max_attempts(self.max_attempts)
            .strategy(self.backoff.clone())
            .run(|| self.request_once(file, category))
            .await?;

        debug!(file = %file.name(), key = %destination.key, expires_in = destination.expires_in_seconds, "Upload destination issued");
        Ok(destination)
    }
}

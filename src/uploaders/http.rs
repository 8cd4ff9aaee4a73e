use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Body, Client};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use super::progress_stream::{ProgressStream, chunked_body};
use crate::core::{ProgressCallback, Result, Transfer, TransferFailure, TransferRequest};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CREDENTIALS_HEADER: &str = "Authorization";

/// 直传对象存储：单个 PUT 请求，带进度
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
    chunk_size: usize,
    credentials_header: String,
}

impl HttpTransfer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
            credentials_header: DEFAULT_CREDENTIALS_HEADER.to_string(),
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn credentials_header(mut self, header: impl Into<String>) -> Self {
        self.credentials_header = header.into();
        self
    }

    async fn put(&self, request: TransferRequest, on_progress: ProgressCallback) -> std::result::Result<(), TransferFailure> {
        let size = request.file.size();
        let stream = ProgressStream::new(chunked_body(request.file.bytes().clone(), self.chunk_size), size, on_progress);

        let mut builder = self
            .client
            .put(request.url.clone())
            .header(CONTENT_TYPE, request.content_type.as_str())
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(stream));

        if let Some(credentials) = &request.credentials {
            builder = builder.header(self.credentials_header.as_str(), credentials.as_str());
        }

        let response = builder.send().await.map_err(failure_from_reqwest)?;
        let status = response.status();
        if status.is_success() {
            debug!(url = %request.url, status = status.as_u16(), "Transfer accepted");
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        let mut failure = TransferFailure::http(status.as_u16());
        if let Some(code) = extract_error_code(&body) {
            failure = failure.with_code(code);
        }
        if let Some(retry_after) = retry_after {
            failure = failure.with_retry_after(retry_after);
        }
        if !body.is_empty() {
            failure = failure.with_message(truncate(&body, 512));
        }

        Err(failure)
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
        cancellation_token: CancellationToken,
    ) -> std::result::Result<(), TransferFailure> {
        tokio::select! {
            result = self.put(request, on_progress) => result,
            _ = cancellation_token.cancelled() => Err(TransferFailure::canceled()),
        }
    }
}

fn failure_from_reqwest(err: reqwest::Error) -> TransferFailure {
    if err.is_timeout() {
        TransferFailure::timeout()
    } else {
        TransferFailure::network(err.to_string())
    }
}

/// `Retry-After` in delta-seconds. HTTP dates are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Machine error code from a JSON body (`code` or `error.code`) or an
/// object-store XML body (`<Code>`).
fn extract_error_code(body: &str) -> Option<String> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let code = value
            .get("code")
            .or_else(|| value.get("error").and_then(|error| error.get("code")))?;
        return code.as_str().map(str::to_string);
    }

    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    Some(body[start..end].trim().to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

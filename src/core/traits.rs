use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;
use super::error_code::TransferFailure;
use super::errors::Result;
use super::types::{FileCategory, FileHandle, UploadDestination};

/// Progress sink, receives whole percentages 0-100 in non-decreasing order.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Fired with the number of tasks found expired in one batch.
pub type SessionExpiredCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Issues time-limited upload destinations - 上传授权服务
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn get_upload_destination(&self, file: &FileHandle, category: FileCategory) -> Result<UploadDestination>;
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    pub file: FileHandle,
    pub content_type: String,
    pub credentials: Option<String>,
}

/// Moves one file's bytes to its destination.
///
/// Implementations must report progress through `on_progress`, stop the
/// network operation once `cancellation_token` fires and enforce their own
/// timeout.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
        cancellation_token: CancellationToken,
    ) -> std::result::Result<(), TransferFailure>;
}

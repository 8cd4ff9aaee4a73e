use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;
use super::error_code::UploadErrorCode;
use super::errors::Result;

/// 上传任务唯一标识
///
/// Assigned when a file is selected and shared between the live task and
/// the durable `FileMetadata` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the file is for. Drives size limits and type allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileCategory {
    Instruction,
    PartsList,
    GalleryImage,
    Thumbnail,
}

impl FileCategory {
    pub const ALL: [FileCategory; 4] = [
        FileCategory::Instruction,
        FileCategory::PartsList,
        FileCategory::GalleryImage,
        FileCategory::Thumbnail,
    ];

    pub fn is_image(self) -> bool {
        matches!(self, FileCategory::GalleryImage | FileCategory::Thumbnail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Instruction => "instruction",
            FileCategory::PartsList => "parts-list",
            FileCategory::GalleryImage => "gallery-image",
            FileCategory::Thumbnail => "thumbnail",
        }
    }

    /// Human readable label used in rejection messages.
    pub fn label(self) -> &'static str {
        match self {
            FileCategory::Instruction => "instruction documents",
            FileCategory::PartsList => "parts-list documents",
            FileCategory::GalleryImage => "gallery images",
            FileCategory::Thumbnail => "thumbnail images",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.as_str() == value)
    }
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 已完成
    Success,
    /// 失败，可重试
    Failed,
    /// 上传授权已过期，需要重新授权
    Expired,
    /// 已取消
    Canceled,
}

impl UploadState {
    /// Occupies (or waits for) a transfer slot.
    pub fn is_active(self) -> bool {
        matches!(self, UploadState::Queued | UploadState::Uploading)
    }

    /// Success or canceled; nothing left to retry or re-authorize.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Success | UploadState::Canceled)
    }

    pub fn can_retry(self) -> bool {
        matches!(self, UploadState::Failed | UploadState::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Queued => "queued",
            UploadState::Uploading => "uploading",
            UploadState::Success => "success",
            UploadState::Failed => "failed",
            UploadState::Expired => "expired",
            UploadState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct FileData {
    name: String,
    mime_type: String,
    last_modified: Option<DateTime<Utc>>,
    bytes: Bytes,
}

/// In-memory file selected for upload.
///
/// Cloning is cheap and shares the same buffer; `ptr_eq` tells whether two
/// handles refer to the very same file.
#[derive(Clone)]
pub struct FileHandle(Arc<FileData>);

impl FileHandle {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::with_last_modified(name, mime_type, None, bytes)
    }

    pub fn with_last_modified(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        last_modified: Option<DateTime<Utc>>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self(Arc::new(FileData {
            name: name.into(),
            mime_type: mime_type.into(),
            last_modified,
            bytes: bytes.into(),
        }))
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let metadata = tokio::fs::metadata(path).await?;
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = extension_of(&name)
            .and_then(|ext| crate::validation::mime_from_extension(&ext))
            .unwrap_or("application/octet-stream");

        Ok(Self::with_last_modified(name, mime_type, last_modified, bytes))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn mime_type(&self) -> &str {
        &self.0.mime_type
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.0.last_modified
    }

    pub fn size(&self) -> u64 {
        self.0.bytes.len() as u64
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0.bytes
    }

    /// Lowercased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.0.name)
    }

    /// Same name and metadata, different content.
    pub fn replace(&self, name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::with_last_modified(name, mime_type, self.0.last_modified, bytes)
    }

    pub fn ptr_eq(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.0.name)
            .field("mime_type", &self.0.mime_type)
            .field("size", &self.0.bytes.len())
            .finish()
    }
}

pub(crate) fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Result of asking the authorization service where a file may be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadDestination {
    pub url: Url,
    pub key: String,
    pub expires_in_seconds: u64,
}

/// Validity span of the current batch of upload authorizations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationWindow {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A validated (and transformed) file with its destination, ready to queue.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub id: UploadId,
    pub file: FileHandle,
    pub category: FileCategory,
    pub upload_url: Url,
    pub upload_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewUpload {
    pub fn new(file: FileHandle, category: FileCategory, upload_url: Url) -> Self {
        Self {
            id: UploadId::new(),
            file,
            category,
            upload_url,
            upload_key: None,
            expires_at: None,
        }
    }

    pub fn with_id(mut self, id: UploadId) -> Self {
        self.id = id;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.upload_key = Some(key.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// A file still waiting for a destination from the authorization provider.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub id: UploadId,
    pub file: FileHandle,
    pub category: FileCategory,
}

impl PendingUpload {
    pub fn new(file: FileHandle, category: FileCategory) -> Self {
        Self {
            id: UploadId::new(),
            file,
            category,
        }
    }

    pub fn with_id(mut self, id: UploadId) -> Self {
        self.id = id;
        self
    }
}

/// Fresh destination for a task after re-authorization.
#[derive(Debug, Clone)]
pub struct DestinationUpdate {
    pub id: UploadId,
    pub upload_url: Url,
    pub upload_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Snapshot of one file's transfer lifecycle.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: UploadId,
    pub file: FileHandle,
    pub file_size: u64,
    pub category: FileCategory,
    pub upload_url: Url,
    pub upload_key: Option<String>,
    /// 上传授权过期时间
    pub expires_at: Option<DateTime<Utc>>,
    pub state: UploadState,
    /// 0-100, never decreases while uploading
    pub progress: u8,
    pub error_code: Option<UploadErrorCode>,
    pub error: Option<String>,
    pub retry_after: Option<Duration>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    pub(crate) fn from_new(upload: NewUpload, now: DateTime<Utc>) -> Self {
        Self {
            id: upload.id,
            file_size: upload.file.size(),
            file: upload.file,
            category: upload.category,
            upload_url: upload.upload_url,
            upload_key: upload.upload_key,
            expires_at: upload.expires_at,
            state: UploadState::Queued,
            progress: 0,
            error_code: None,
            error: None,
            retry_after: None,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn file_name(&self) -> &str {
        self.file.name()
    }

    pub(crate) fn clear_error(&mut self) {
        self.error_code = None;
        self.error = None;
        self.retry_after = None;
    }

    pub(crate) fn set_error(&mut self, code: UploadErrorCode, message: impl Into<String>) {
        self.error_code = Some(code);
        self.error = Some(message.into());
    }
}

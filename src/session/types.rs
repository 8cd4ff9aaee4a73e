use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{FileCategory, FileHandle, UploadId};

/// 持久化格式版本，不一致的记录直接丢弃
pub const SESSION_VERSION: u32 = 1;
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const WRITE_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderStep {
    #[default]
    Details,
    Files,
    Review,
}

/// Durable status tag, coarser than the live task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// What survives a reload about a selected file. The bytes do not; the
/// live `UploadTask` is found again through `id`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: UploadId,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// epoch ms
    pub last_modified: i64,
    pub category: FileCategory,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_key: Option<String>,
}

impl FileMetadata {
    pub fn from_file(id: UploadId, file: &FileHandle, category: FileCategory) -> Self {
        Self {
            id,
            name: file.name().to_string(),
            size: file.size(),
            mime_type: file.mime_type().to_string(),
            last_modified: file.last_modified().map(|t| t.timestamp_millis()).unwrap_or(0),
            category,
            status: FileStatus::Pending,
            upload_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderSession {
    pub version: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub upload_token: Option<String>,
    #[serde(default)]
    pub step: UploaderStep,
    #[serde(default)]
    pub files: Vec<FileMetadata>,
    /// Only set while no authenticated identity owns the draft.
    pub anon_session_id: Option<String>,
    /// epoch ms
    pub updated_at: i64,
}

impl UploaderSession {
    pub fn empty(anon_session_id: Option<String>, now_ms: i64) -> Self {
        Self {
            version: SESSION_VERSION,
            title: String::new(),
            description: String::new(),
            tags: Vec::new(),
            theme: None,
            upload_token: None,
            step: UploaderStep::Details,
            files: Vec::new(),
            anon_session_id,
            updated_at: now_ms,
        }
    }

    /// Nothing the user would miss.
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.description.is_empty()
            && self.tags.is_empty()
            && self.theme.is_none()
            && self.upload_token.is_none()
            && self.files.is_empty()
            && self.step == UploaderStep::Details
    }

    pub fn is_expired(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.updated_at) > ttl.as_millis() as i64
    }
}

/// Partial update of the draft fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub theme: Option<String>,
    pub upload_token: Option<String>,
    pub step: Option<UploaderStep>,
}

impl SessionPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub(crate) fn apply(self, session: &mut UploaderSession) {
        if let Some(title) = self.title {
            session.title = title;
        }
        if let Some(description) = self.description {
            session.description = description;
        }
        if let Some(tags) = self.tags {
            session.tags = tags;
        }
        if let Some(theme) = self.theme {
            session.theme = Some(theme);
        }
        if let Some(upload_token) = self.upload_token {
            session.upload_token = Some(upload_token);
        }
        if let Some(step) = self.step {
            session.step = step;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileMetadataPatch {
    pub name: Option<String>,
    pub category: Option<FileCategory>,
    pub status: Option<FileStatus>,
    pub upload_key: Option<String>,
}

impl FileMetadataPatch {
    pub fn status(status: FileStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub(crate) fn apply(self, file: &mut FileMetadata) {
        if let Some(name) = self.name {
            file.name = name;
        }
        if let Some(category) = self.category {
            file.category = category;
        }
        if let Some(status) = self.status {
            file.status = status;
        }
        if let Some(upload_key) = self.upload_key {
            file.upload_key = Some(upload_key);
        }
    }
}

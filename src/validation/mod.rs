//! 上传前的文件校验
//!
//! Pure checks run before a file is allowed into the scheduler: byte size
//! against the category limits and declared type against the allow-list.

use serde::Serialize;
use crate::core::{FileCategory, FileHandle, UploadErrorCode};
use crate::utils::format_file_size;

pub const MB: u64 = 1024 * 1024;

pub const DOCUMENT_MIN_BYTES: u64 = 100;
pub const DOCUMENT_MAX_BYTES: u64 = 10 * MB;
pub const IMAGE_MIN_BYTES: u64 = 1;
pub const IMAGE_MAX_BYTES: u64 = 10 * MB;

pub const GENERIC_MIME_TYPE: &str = "application/octet-stream";

const DOCUMENT_TYPES: &[&str] = &["application/pdf"];
const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/heic", "image/heif"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub min_bytes: u64,
    pub max_bytes: u64,
}

pub fn limits(category: FileCategory) -> SizeLimits {
    if category.is_image() {
        SizeLimits {
            min_bytes: IMAGE_MIN_BYTES,
            max_bytes: IMAGE_MAX_BYTES,
        }
    } else {
        SizeLimits {
            min_bytes: DOCUMENT_MIN_BYTES,
            max_bytes: DOCUMENT_MAX_BYTES,
        }
    }
}

pub fn allowed_mime_types(category: FileCategory) -> &'static [&'static str] {
    if category.is_image() { IMAGE_TYPES } else { DOCUMENT_TYPES }
}

/// MIME type for a lowercased extension, limited to the types we accept.
pub fn mime_from_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => return None,
    };
    Some(mime)
}

/// Declared MIME type, or a guess from the extension when the declared
/// type is empty or generic.
pub fn effective_mime_type(file: &FileHandle) -> Option<String> {
    let declared = file.mime_type().trim();
    if !declared.is_empty() && !declared.eq_ignore_ascii_case(GENERIC_MIME_TYPE) {
        return Some(declared.to_ascii_lowercase());
    }

    file.extension()
        .and_then(|ext| mime_from_extension(&ext))
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorKind {
    FileTooSmall,
    FileTooLarge,
    InvalidType,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    /// Rejected files always surface as `VALIDATION_ERROR`.
    pub fn code(&self) -> UploadErrorCode {
        UploadErrorCode::ValidationError
    }
}

pub fn validate(file: &FileHandle, category: FileCategory) -> Result<(), ValidationError> {
    let limits = limits(category);
    let size = file.size();

    if size < limits.min_bytes {
        return Err(ValidationError::new(
            ValidationErrorKind::FileTooSmall,
            format!(
                "{} is too small. Minimum size for {} is {}.",
                file.name(),
                category.label(),
                format_file_size(limits.min_bytes)
            ),
        ));
    }

    if size > limits.max_bytes {
        return Err(ValidationError::new(
            ValidationErrorKind::FileTooLarge,
            format!(
                "{} is too large ({}). Maximum size for {} is {}.",
                file.name(),
                format_file_size(size),
                category.label(),
                format_file_size(limits.max_bytes)
            ),
        ));
    }

    let allowed = allowed_mime_types(category);
    let accepted = effective_mime_type(file)
        .map(|mime| allowed.contains(&mime.as_str()))
        .unwrap_or(false);

    if !accepted {
        let shown = if file.mime_type().is_empty() { "unknown" } else { file.mime_type() };
        return Err(ValidationError::new(
            ValidationErrorKind::InvalidType,
            format!(
                "{} has unsupported type {}. Allowed types for {}: {}.",
                file.name(),
                shown,
                category.label(),
                allowed.join(", ")
            ),
        ));
    }

    Ok(())
}

/// Validate a whole selection, returning the index and reason of each reject.
pub fn validate_files<'a>(
    files: impl IntoIterator<Item = &'a FileHandle>,
    category: FileCategory,
) -> Vec<(usize, ValidationError)> {
    files
        .into_iter()
        .enumerate()
        .filter_map(|(index, file)| validate(file, category).err().map(|err| (index, err)))
        .collect()
}

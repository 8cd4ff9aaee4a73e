//! Camera-native formats (HEIC/HEIF) that most consumers cannot display.

use crate::core::{FileHandle, extension_of};

pub const CAMERA_NATIVE_MIME_TYPES: &[&str] = &["image/heic", "image/heif"];
pub const CAMERA_NATIVE_EXTENSIONS: &[&str] = &["heic", "heif"];

/// Checks the MIME type first, then the extension regardless of the
/// declared type.
pub fn is_camera_native(file: &FileHandle) -> bool {
    let mime = file.mime_type().to_ascii_lowercase();
    if CAMERA_NATIVE_MIME_TYPES.contains(&mime.as_str()) {
        return true;
    }

    file.extension()
        .map(|ext| CAMERA_NATIVE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// `IMG_0001.HEIC` -> `IMG_0001.jpg`. Other names are returned unchanged.
pub fn to_jpeg_filename(name: &str) -> String {
    match extension_of(name) {
        Some(ext) if CAMERA_NATIVE_EXTENSIONS.contains(&ext.as_str()) => {
            let stem = &name[..name.len() - ext.len() - 1];
            format!("{}.jpg", stem)
        }
        _ => name.to_string(),
    }
}

/// Swap (or append) the extension.
pub(crate) fn with_extension(name: &str, extension: &str) -> String {
    match extension_of(name) {
        Some(ext) => format!("{}.{}", &name[..name.len() - ext.len() - 1], extension),
        None => format!("{}.{}", name, extension),
    }
}

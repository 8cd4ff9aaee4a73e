use std::sync::Arc;
use tracing::{debug, warn};
use super::camera::{is_camera_native, to_jpeg_filename, with_extension};
use super::codec::ImageCodec;
use super::presets::CompressionConfig;
use crate::core::{FileHandle, ProgressCallback};
use crate::utils::format_file_size;

/// Files below this size are left alone when their dimensions already fit.
pub const SKIP_COMPRESSION_SIZE_THRESHOLD: u64 = 500 * 1024;

pub const DEFAULT_CONVERSION_QUALITY: f32 = 0.9;

const UNKNOWN_CONVERSION_ERROR: &str = "Unknown conversion error";
const UNKNOWN_COMPRESSION_ERROR: &str = "Unknown compression error";

/// 格式转换结果
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub applied: bool,
    pub file: FileHandle,
    pub original_size: u64,
    pub final_size: u64,
    pub error: Option<String>,
}

impl ConversionResult {
    fn unchanged(file: &FileHandle, error: Option<String>) -> Self {
        Self {
            applied: false,
            file: file.clone(),
            original_size: file.size(),
            final_size: file.size(),
            error,
        }
    }
}

/// 压缩结果
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub applied: bool,
    pub file: FileHandle,
    pub original_size: u64,
    pub final_size: u64,
    /// final / original, 1.0 when nothing changed
    pub ratio: f64,
    pub error: Option<String>,
}

impl CompressionResult {
    pub(crate) fn unchanged(file: &FileHandle, error: Option<String>) -> Self {
        Self {
            applied: false,
            file: file.clone(),
            original_size: file.size(),
            final_size: file.size(),
            ratio: 1.0,
            error,
        }
    }

    pub(crate) fn replaced(original_size: u64, file: FileHandle) -> Self {
        let final_size = file.size();
        Self {
            applied: true,
            file,
            original_size,
            final_size,
            ratio: if original_size == 0 { 1.0 } else { final_size as f64 / original_size as f64 },
            error: None,
        }
    }
}

fn report(callback: &Option<ProgressCallback>, percent: u8) {
    if let Some(callback) = callback {
        callback(percent);
    }
}

/// Re-encode HEIC/HEIF as JPEG. Failures hand back the original file.
pub async fn convert_camera_native(
    codec: Arc<dyn ImageCodec>,
    file: &FileHandle,
    quality: f32,
    on_progress: Option<ProgressCallback>,
) -> ConversionResult {
    if !is_camera_native(file) {
        return ConversionResult::unchanged(file, None);
    }

    report(&on_progress, 0);

    let data = file.bytes().clone();
    let outcome = tokio::task::spawn_blocking(move || codec.convert_to_jpeg(&data, quality)).await;

    let encoded = match outcome {
        Ok(Ok(encoded)) => encoded,
        Ok(Err(err)) => {
            warn!(file = %file.name(), error = %err, "Camera-native conversion failed, keeping original");
            return ConversionResult::unchanged(file, Some(err.to_string()));
        }
        Err(err) => {
            warn!(file = %file.name(), error = %err, "Conversion task panicked");
            return ConversionResult::unchanged(file, Some(UNKNOWN_CONVERSION_ERROR.to_string()));
        }
    };

    let converted = file.replace(to_jpeg_filename(file.name()), "image/jpeg", encoded);
    report(&on_progress, 100);

    debug!(
        from = %file.name(),
        to = %converted.name(),
        size = %format_file_size(converted.size()),
        "Converted camera-native image"
    );

    ConversionResult {
        applied: true,
        original_size: file.size(),
        final_size: converted.size(),
        file: converted,
        error: None,
    }
}

/// Small files whose dimensions already fit are not worth re-encoding.
/// A failed probe means "compress".
pub async fn should_skip_compression(codec: Arc<dyn ImageCodec>, file: &FileHandle, config: &CompressionConfig) -> bool {
    if file.size() >= SKIP_COMPRESSION_SIZE_THRESHOLD {
        return false;
    }

    let data = file.bytes().clone();
    let max_dimension = config.max_dimension;
    match tokio::task::spawn_blocking(move || codec.dimensions(&data)).await {
        Ok(Ok((width, height))) => width <= max_dimension && height <= max_dimension,
        Ok(Err(err)) => {
            debug!(file = %file.name(), error = %err, "Dimension probe failed");
            false
        }
        Err(_) => false,
    }
}

pub async fn compress_image(
    codec: Arc<dyn ImageCodec>,
    file: &FileHandle,
    config: &CompressionConfig,
    skip_check: bool,
    on_progress: Option<ProgressCallback>,
) -> CompressionResult {
    if !skip_check && should_skip_compression(codec.clone(), file, config).await {
        debug!(file = %file.name(), size = file.size(), "Skipping compression");
        return CompressionResult::unchanged(file, None);
    }

    report(&on_progress, 0);

    let data = file.bytes().clone();
    let config = *config;
    let step_callback = on_progress.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let on_step = |percent: u8| report(&step_callback, percent);
        codec.compress(&data, &config, &on_step)
    })
    .await;

    let result = match outcome {
        Ok(Ok(encoded)) if encoded.len() as u64 >= file.size() => {
            debug!(
                file = %file.name(),
                original = file.size(),
                compressed = encoded.len(),
                "Compressed output not smaller, keeping original"
            );
            CompressionResult::unchanged(file, None)
        }
        Ok(Ok(encoded)) => {
            let name = with_extension(file.name(), config.output.extension());
            let compressed = file.replace(name, config.output.mime_type(), encoded);
            CompressionResult::replaced(file.size(), compressed)
        }
        Ok(Err(err)) => {
            warn!(file = %file.name(), error = %err, "Compression failed, keeping original");
            CompressionResult::unchanged(file, Some(err.to_string()))
        }
        Err(err) => {
            warn!(file = %file.name(), error = %err, "Compression task panicked");
            CompressionResult::unchanged(file, Some(UNKNOWN_COMPRESSION_ERROR.to_string()))
        }
    };

    report(&on_progress, 100);

    if result.applied {
        debug!(
            file = %result.file.name(),
            original = %format_file_size(result.original_size),
            compressed = %format_file_size(result.final_size),
            ratio = result.ratio,
            "Image compressed"
        );
    }

    result
}

use std::sync::Arc;
use tracing::debug;
use super::camera::is_camera_native;
use super::codec::{ImageCodec, RasterCodec};
use super::compress::{
    CompressionResult,
    ConversionResult,
    DEFAULT_CONVERSION_QUALITY,
    compress_image,
    convert_camera_native,
};
use super::presets::{CompressionConfig, CompressionPreset};
use crate::core::{FileHandle, ProgressCallback};
use crate::validation::effective_mime_type;

/// 上传前的处理选项
#[derive(Clone)]
pub struct TransformOptions {
    pub convert_camera_native: bool,
    pub compress: bool,
    pub preset: CompressionPreset,
    /// Overrides the preset's config when set.
    pub config: Option<CompressionConfig>,
    pub conversion_quality: f32,
    /// Compress even when the file is small and already fits.
    pub skip_check: bool,
    /// Already reduced elsewhere; used as-is instead of compressing.
    pub pre_reduced: Option<FileHandle>,
    pub on_conversion_progress: Option<ProgressCallback>,
    pub on_compression_progress: Option<ProgressCallback>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            convert_camera_native: true,
            compress: true,
            preset: CompressionPreset::default(),
            config: None,
            conversion_quality: DEFAULT_CONVERSION_QUALITY,
            skip_check: false,
            pre_reduced: None,
            on_conversion_progress: None,
            on_compression_progress: None,
        }
    }
}

impl TransformOptions {
    pub fn with_preset(mut self, preset: CompressionPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn compression_config(&self) -> CompressionConfig {
        self.config.unwrap_or_else(|| self.preset.config())
    }
}

impl std::fmt::Debug for TransformOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformOptions")
            .field("convert_camera_native", &self.convert_camera_native)
            .field("compress", &self.compress)
            .field("preset", &self.preset)
            .field("config", &self.config)
            .field("skip_check", &self.skip_check)
            .field("pre_reduced", &self.pre_reduced)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    /// What should be uploaded.
    pub file: FileHandle,
    /// `None` when the file was not camera-native or conversion was off.
    pub conversion: Option<ConversionResult>,
    /// `None` when compression did not apply to this file.
    pub compression: Option<CompressionResult>,
}

/// Normalizes format and size of a file before upload. Never fails: every
/// stage degrades to passing the file through.
#[derive(Clone)]
pub struct TransformPipeline {
    codec: Arc<dyn ImageCodec>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new(Arc::new(RasterCodec::new()))
    }
}

impl TransformPipeline {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self { codec }
    }

    pub async fn transform(&self, file: &FileHandle, options: &TransformOptions) -> TransformOutput {
        let mut current = file.clone();

        let conversion = if options.convert_camera_native && is_camera_native(&current) {
            let result = convert_camera_native(
                self.codec.clone(),
                &current,
                options.conversion_quality,
                options.on_conversion_progress.clone(),
            )
            .await;
            current = result.file.clone();
            Some(result)
        } else {
            None
        };

        let compression = if let Some(pre_reduced) = &options.pre_reduced {
            debug!(file = %file.name(), "Using pre-reduced file");
            let result = CompressionResult::replaced(current.size(), pre_reduced.clone());
            current = pre_reduced.clone();
            Some(result)
        } else if options.compress && is_image(&current) {
            let config = options.compression_config();
            let result = compress_image(
                self.codec.clone(),
                &current,
                &config,
                options.skip_check,
                options.on_compression_progress.clone(),
            )
            .await;
            current = result.file.clone();
            Some(result)
        } else {
            None
        };

        TransformOutput {
            file: current,
            conversion,
            compression,
        }
    }
}

fn is_image(file: &FileHandle) -> bool {
    effective_mime_type(file)
        .map(|mime| mime.starts_with("image/"))
        .unwrap_or(false)
}

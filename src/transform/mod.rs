//! 上传前的图片处理：HEIC 转 JPEG，按预设压缩

mod camera;
mod codec;
mod compress;
mod pipeline;
mod presets;

pub use camera::{CAMERA_NATIVE_EXTENSIONS, CAMERA_NATIVE_MIME_TYPES, is_camera_native, to_jpeg_filename};
pub use codec::{ImageCodec, RasterCodec};
pub use compress::{
    CompressionResult,
    ConversionResult,
    DEFAULT_CONVERSION_QUALITY,
    SKIP_COMPRESSION_SIZE_THRESHOLD,
    compress_image,
    convert_camera_native,
    should_skip_compression,
};
pub use pipeline::{TransformOptions, TransformOutput, TransformPipeline};
pub use presets::{CompressionConfig, CompressionPreset, OutputFormat, is_valid_preset_name, preset_by_name};

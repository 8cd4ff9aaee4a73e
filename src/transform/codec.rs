use std::io::Cursor;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use super::presets::{CompressionConfig, OutputFormat};
use crate::core::Result;

const QUALITY_STEP: u8 = 10;
const MIN_QUALITY: u8 = 10;

/// 图片编解码
///
/// Everything here is synchronous and CPU bound; callers run it on the
/// blocking pool.
pub trait ImageCodec: Send + Sync {
    /// Width and height without decoding the pixel data.
    fn dimensions(&self, data: &[u8]) -> Result<(u32, u32)>;

    /// Re-encode a camera-native image as JPEG. `quality` is 0.0-1.0.
    fn convert_to_jpeg(&self, data: &[u8], quality: f32) -> Result<Bytes>;

    /// Downscale and re-encode according to `config`, reporting 0-99
    /// progress through `on_step`.
    fn compress(&self, data: &[u8], config: &CompressionConfig, on_step: &dyn Fn(u8)) -> Result<Bytes>;
}

/// `image` crate backed codec. Decodes whatever formats the crate was built
/// with; HEIC is not among them, so conversion fails and callers fall back
/// to the original file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterCodec {
    pub filter: Option<FilterType>,
}

impl RasterCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(data: &[u8]) -> Result<DynamicImage> {
        let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        Ok(reader.decode()?)
    }

    fn fit_within(&self, image: DynamicImage, max_dimension: u32) -> DynamicImage {
        if image.width() <= max_dimension && image.height() <= max_dimension {
            return image;
        }
        // resize 保持宽高比
        image.resize(max_dimension, max_dimension, self.filter.unwrap_or(FilterType::Lanczos3))
    }

    fn encode(image: &DynamicImage, output: OutputFormat, quality: u8) -> Result<Bytes> {
        let mut buffer = Vec::new();
        match output {
            OutputFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
                image.write_with_encoder(encoder)?;
            }
            other => {
                image.write_to(&mut Cursor::new(&mut buffer), other.image_format())?;
            }
        }
        Ok(Bytes::from(buffer))
    }
}

fn quality_percent(quality: f32) -> u8 {
    (quality.clamp(0.0, 1.0) * 100.0).round().max(MIN_QUALITY as f32) as u8
}

impl ImageCodec for RasterCodec {
    fn dimensions(&self, data: &[u8]) -> Result<(u32, u32)> {
        let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        Ok(reader.into_dimensions()?)
    }

    fn convert_to_jpeg(&self, data: &[u8], quality: f32) -> Result<Bytes> {
        let image = Self::decode(data)?;
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        Self::encode(&rgb, OutputFormat::Jpeg, quality_percent(quality))
    }

    fn compress(&self, data: &[u8], config: &CompressionConfig, on_step: &dyn Fn(u8)) -> Result<Bytes> {
        let image = Self::decode(data)?;
        on_step(10);

        let image = self.fit_within(image, config.max_dimension);
        // JPEG 不支持透明通道
        let image = if config.output == OutputFormat::Jpeg {
            DynamicImage::ImageRgb8(image.to_rgb8())
        } else {
            image
        };
        on_step(30);

        let mut quality = quality_percent(config.quality);
        let mut attempt: u8 = 0;
        loop {
            let encoded = Self::encode(&image, config.output, quality)?;
            attempt = attempt.saturating_add(1);

            let fits = encoded.len() as u64 <= config.max_size_bytes;
            if fits || !config.output.is_lossy() || quality <= MIN_QUALITY {
                tracing::debug!(
                    quality,
                    attempts = attempt,
                    size = encoded.len(),
                    width = image.width(),
                    height = image.height(),
                    "Image encoded"
                );
                return Ok(encoded);
            }

            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
            on_step((30 + attempt.saturating_mul(7)).min(95));
        }
    }
}

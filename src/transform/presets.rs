use image::ImageFormat;
use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Encoding written by the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::WebP => ImageFormat::WebP,
        }
    }

    /// Only lossy encodings honour `quality`.
    pub fn is_lossy(self) -> bool {
        matches!(self, OutputFormat::Jpeg)
    }
}

/// 压缩参数
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CompressionConfig {
    /// Longest edge after downscaling, in pixels.
    pub max_dimension: u32,
    /// Target upper bound for the encoded output.
    pub max_size_bytes: u64,
    /// Initial encoder quality, 0.1-1.0.
    pub quality: f32,
    pub output: OutputFormat,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionPreset::Balanced.config()
    }
}

/// Named compression tiers offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum CompressionPreset {
    #[serde(rename = "low-bandwidth")]
    SpaceSaving,
    #[default]
    #[serde(rename = "balanced")]
    Balanced,
    #[serde(rename = "high-quality")]
    HighFidelity,
}

impl CompressionPreset {
    pub const ALL: [CompressionPreset; 3] = [
        CompressionPreset::SpaceSaving,
        CompressionPreset::Balanced,
        CompressionPreset::HighFidelity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompressionPreset::SpaceSaving => "low-bandwidth",
            CompressionPreset::Balanced => "balanced",
            CompressionPreset::HighFidelity => "high-quality",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CompressionPreset::SpaceSaving => "Low bandwidth",
            CompressionPreset::Balanced => "Balanced",
            CompressionPreset::HighFidelity => "High quality",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CompressionPreset::SpaceSaving => "Smallest files, fastest uploads on slow connections",
            CompressionPreset::Balanced => "Good quality with reasonable file size",
            CompressionPreset::HighFidelity => "Best quality, larger files",
        }
    }

    /// Rough size of a typical photo after compression.
    pub fn estimated_size(self) -> &'static str {
        match self {
            CompressionPreset::SpaceSaving => "~300KB",
            CompressionPreset::Balanced => "~800KB",
            CompressionPreset::HighFidelity => "~1.5MB",
        }
    }

    pub fn config(self) -> CompressionConfig {
        match self {
            CompressionPreset::SpaceSaving => CompressionConfig {
                max_dimension: 1200,
                max_size_bytes: MB / 2,
                quality: 0.6,
                output: OutputFormat::Jpeg,
            },
            CompressionPreset::Balanced => CompressionConfig {
                max_dimension: 1920,
                max_size_bytes: MB,
                quality: 0.8,
                output: OutputFormat::Jpeg,
            },
            CompressionPreset::HighFidelity => CompressionConfig {
                max_dimension: 2400,
                max_size_bytes: 2 * MB,
                quality: 0.9,
                output: OutputFormat::Jpeg,
            },
        }
    }
}

impl std::fmt::Display for CompressionPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Look up a preset by its wire name, falling back to `Balanced`.
pub fn preset_by_name(name: &str) -> CompressionPreset {
    CompressionPreset::ALL
        .into_iter()
        .find(|preset| preset.name() == name)
        .unwrap_or_default()
}

/// Case sensitive.
pub fn is_valid_preset_name(name: &str) -> bool {
    CompressionPreset::ALL.iter().any(|preset| preset.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_settings() {
        let low = CompressionPreset::SpaceSaving.config();
        assert_eq!(low.max_dimension, 1200);
        assert_eq!(low.max_size_bytes, 512 * 1024);
        assert_eq!(low.quality, 0.6);

        let balanced = CompressionPreset::Balanced.config();
        assert_eq!(balanced, CompressionConfig::default());
        assert_eq!(balanced.max_dimension, 1920);
        assert_eq!(balanced.quality, 0.8);

        let high = CompressionPreset::HighFidelity.config();
        assert_eq!(high.max_dimension, 2400);
        assert_eq!(high.max_size_bytes, 2 * 1024 * 1024);
        assert_eq!(high.output, OutputFormat::Jpeg);
        assert_eq!(CompressionPreset::HighFidelity.estimated_size(), "~1.5MB");
    }

    #[test]
    fn test_preset_lookup() {
        assert_eq!(preset_by_name("low-bandwidth"), CompressionPreset::SpaceSaving);
        assert_eq!(preset_by_name("high-quality"), CompressionPreset::HighFidelity);
        assert_eq!(preset_by_name("invalid"), CompressionPreset::Balanced);
        assert_eq!(preset_by_name(""), CompressionPreset::Balanced);

        assert!(is_valid_preset_name("balanced"));
        assert!(!is_valid_preset_name("Balanced"));
        assert!(!is_valid_preset_name("HIGH-QUALITY"));
    }

    #[test]
    fn test_preset_serde_uses_wire_names() {
        let json = serde_json::to_string(&CompressionPreset::SpaceSaving).unwrap();
        assert_eq!(json, "\"low-bandwidth\"");
        let preset: CompressionPreset = serde_json::from_str("\"high-quality\"").unwrap();
        assert_eq!(preset, CompressionPreset::HighFidelity);
    }
}

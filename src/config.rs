//! TOML configuration for the uploader binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use serde::Deserialize;
use url::Url;
use crate::core::{Result, UploaderError};
use crate::scheduler::{SchedulerConfig, DEFAULT_CONCURRENCY, DEFAULT_EXPIRY_BUFFER};
use crate::session::{SessionConfig, SESSION_TTL, WRITE_DEBOUNCE};
use crate::transform::{preset_by_name, is_valid_preset_name, TransformOptions};
use crate::uploaders::http::{DEFAULT_CHUNK_SIZE, DEFAULT_CREDENTIALS_HEADER};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

static CONFIG: OnceLock<UploaderConfig> = OnceLock::new();

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct UploaderConfig {
    pub scheduler: SchedulerSection,
    pub transfer: TransferSection,
    pub authorization: AuthorizationSection,
    pub transform: TransformSection,
    pub session: SessionSection,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerSection {
    pub concurrency: usize,
    pub expiry_buffer_secs: u64,
    /// 0 关闭看门狗
    pub transfer_timeout_secs: u64,
    pub event_capacity: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER.as_secs(),
            transfer_timeout_secs: 0,
            event_capacity: 256,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TransferSection {
    pub timeout_secs: u64,
    pub chunk_size: usize,
    pub credentials_header: String,
    pub credentials: Option<String>,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            chunk_size: DEFAULT_CHUNK_SIZE,
            credentials_header: DEFAULT_CREDENTIALS_HEADER.to_string(),
            credentials: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthorizationSection {
    /// Presign endpoint. Required to upload.
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for AuthorizationSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            timeout_secs: 30,
            max_attempts: 3,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TransformSection {
    pub convert_camera_native: bool,
    pub compress: bool,
    pub preset: String,
    pub conversion_quality: f32,
    pub skip_check: bool,
}

impl Default for TransformSection {
    fn default() -> Self {
        let options = TransformOptions::default();
        Self {
            convert_camera_native: options.convert_camera_native,
            compress: options.compress,
            preset: options.preset.name().to_string(),
            conversion_quality: options.conversion_quality,
            skip_check: options.skip_check,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionSection {
    /// No durable session when unset.
    pub dir: Option<PathBuf>,
    pub route: String,
    pub user: Option<String>,
    pub ttl_secs: u64,
    pub debounce_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            dir: None,
            route: "/instructions/new".to_string(),
            user: None,
            ttl_secs: SESSION_TTL.as_secs(),
            debounce_ms: WRITE_DEBOUNCE.as_millis() as u64,
        }
    }
}

impl UploaderConfig {
    pub fn load_config(path: impl AsRef<Path>) -> Result<UploaderConfig> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)?;
        let config = Self::from_toml(&config_str)
            .map_err(|err| UploaderError::Config(format!("{}: {}", path.display(), err)))?;
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<UploaderConfig> {
        let config: UploaderConfig = toml::from_str(source).map_err(|err| UploaderError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency == 0 {
            return Err(UploaderError::Config("scheduler.concurrency must be at least 1".into()));
        }
        if !is_valid_preset_name(&self.transform.preset) {
            return Err(UploaderError::Config(format!("unknown preset `{}`", self.transform.preset)));
        }
        if !(0.0..=1.0).contains(&self.transform.conversion_quality) {
            return Err(UploaderError::Config("transform.conversion_quality must be within 0..=1".into()));
        }
        if let Some(endpoint) = &self.authorization.endpoint {
            Url::parse(endpoint)?;
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.scheduler.concurrency,
            expiry_buffer: Duration::from_secs(self.scheduler.expiry_buffer_secs),
            transfer_timeout: match self.scheduler.transfer_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            credentials: self.transfer.credentials.clone(),
            event_capacity: self.scheduler.event_capacity,
        }
    }

    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            convert_camera_native: self.transform.convert_camera_native,
            compress: self.transform.compress,
            conversion_quality: self.transform.conversion_quality,
            skip_check: self.transform.skip_check,
            ..TransformOptions::default()
        }
        .with_preset(preset_by_name(&self.transform.preset))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl: Duration::from_secs(self.session.ttl_secs),
            debounce: Duration::from_millis(self.session.debounce_ms),
        }
    }

    pub fn authorization_endpoint(&self) -> Result<Option<Url>> {
        self.authorization
            .endpoint
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(Into::into)
    }
}

/// Load once per process; later calls return the first result.
pub fn init_config(path: impl AsRef<Path>) -> Result<&'static UploaderConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = UploaderConfig::load_config(path)?;
    Ok(CONFIG.get_or_init(|| config))
}

pub fn get_config() -> Option<&'static UploaderConfig> {
    CONFIG.get()
}

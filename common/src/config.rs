use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// How the external frame producer is invoked.
#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegConfig {
    /// Executable name or path of the producer.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Pixel format forced on bitmap output.
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_ffmpeg_loglevel")]
    pub loglevel: String,
    /// How long a detached producer may keep running before it is killed.
    #[serde(default = "default_detach_grace")]
    pub detach_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            pixel_format: default_pixel_format(),
            loglevel: default_ffmpeg_loglevel(),
            detach_grace_secs: default_detach_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl FfmpegConfig {
    pub fn detach_grace(&self) -> Duration {
        Duration::from_secs(self.detach_grace_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8088
}
fn default_request_timeout() -> u64 {
    60
}
fn default_binary() -> String {
    "ffmpeg".into()
}
fn default_pixel_format() -> String {
    "bgr24".into()
}
fn default_ffmpeg_loglevel() -> String {
    "error".into()
}
fn default_detach_grace() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

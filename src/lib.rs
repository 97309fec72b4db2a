pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::net::{IpAddr, Ipv4Addr};

use capture::frame::{CaptureFormat, FieldOrder, PixelFormat};
use config::{ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{DeviceError, NoFrameYet};
pub use pipeline::{FramePublisher, FramePump};

/// Prefix for environment overrides, e.g. `CAMSNAP_SERVER__PORT=8080`.
pub const ENV_PREFIX: &str = "CAMSNAP";

/// System configuration, fixed for the lifetime of the process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub field_order: FieldOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Path the latest frame is served on
    pub path: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 1280,
            height: 960,
            format: PixelFormat::Mjpeg,
            field_order: FieldOrder::Progressive,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            path: "/image.jpg".into(),
        }
    }
}

impl CaptureConfig {
    /// Format to ask the driver for. `size_image` is left for the driver.
    pub fn requested_format(&self) -> CaptureFormat {
        CaptureFormat {
            width: self.width,
            height: self.height,
            format: self.format,
            field_order: self.field_order,
            size_image: 0,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if it exists, then `CAMSNAP_*`
    /// environment variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Message(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Message(
                "capture.width and capture.height must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

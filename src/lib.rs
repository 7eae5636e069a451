pub mod capture;
pub mod error;
pub mod illuminator;
pub mod link;
pub mod sensor;
pub mod server;
pub mod settings;
pub mod status;
pub mod stream;
#[cfg(feature = "v4l2")]
pub mod utils;
pub mod watchdog;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameLease};
pub use error::{CamError, Result};

use illuminator::IlluminatorConfig;
use link::LinkConfig;
use sensor::{DeviceDescriptor, SensorBackend, SensorConfig};
use stream::StreamConfig;
use watchdog::WatchdogConfig;

/// System configuration, read once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceDescriptor,
    pub capture: CaptureConfig,
    pub sensor: SensorConfig,
    pub stream: StreamConfig,
    pub watchdog: WatchdogConfig,
    pub link: LinkConfig,
    pub illuminator: IlluminatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: SensorBackend,
    /// Wait after a capture miss before the caller retries
    pub miss_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 80)),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: SensorBackend::default(),
            miss_delay_ms: 100,
        }
    }
}

impl CaptureConfig {
    pub fn miss_delay(&self) -> Duration {
        Duration::from_millis(self.miss_delay_ms)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `CAMSTREAM__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CAMSTREAM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::FrameSize;

    #[test]
    fn defaults_match_reference_timings() {
        let config = Config::default();
        assert_eq!(config.capture.miss_delay_ms, 100);
        assert_eq!(config.stream.pacing_ms, 30);
        assert_eq!(config.watchdog.interval_ms, 30_000);
        assert_eq!(config.link.startup_attempts, 20);
        assert_eq!(config.sensor.frame_size, FrameSize::Vga);
        assert!(!config.stream.exclusive);
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let path = std::env::temp_dir().join(format!("camstream-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[server]
bind = "127.0.0.1:8080"

[sensor]
frame_size = "svga"
quality = 20

[stream]
exclusive = true

[capture]
backend = "synthetic"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.bind, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.sensor.frame_size, FrameSize::Svga);
        assert_eq!(config.sensor.quality, 20);
        assert_eq!(config.sensor.brightness, 0);
        assert!(config.stream.exclusive);
        assert_eq!(config.stream.pacing_ms, 30);
        assert_eq!(config.capture.backend, SensorBackend::Synthetic);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/camstream.toml"))).unwrap_err();
        assert!(matches!(err, CamError::Config(_)));
    }
}

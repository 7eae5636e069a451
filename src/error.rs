use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CamError>;

#[derive(Debug, Error)]
pub enum CamError {
    /// The sensor could not be brought up. Fatal at startup.
    #[error("sensor initialization failed for {device}: {reason}")]
    SensorInit { device: String, reason: String },

    /// The network link never came up inside the startup window. Fatal.
    #[error("network link {link} still down after {waited:?}")]
    LinkTimeout { link: String, waited: Duration },

    #[error("link control failed: {0}")]
    Link(String),

    /// The flash output line could not be requested or driven.
    #[error("illuminator line {chip}:{line} failed: {source}")]
    Illuminator {
        chip: String,
        line: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

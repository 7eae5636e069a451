//! Flash / illuminator output line

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CamError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IlluminatorConfig {
    /// GPIO character device, e.g. `gpiochip0`. Unset keeps the flash in memory only.
    pub gpio_chip: Option<String>,
    /// Line offset on `gpio_chip`
    pub gpio_line: u32,
}

impl Default for IlluminatorConfig {
    fn default() -> Self {
        Self {
            gpio_chip: None,
            gpio_line: 4,
        }
    }
}

/// One digital output.
pub trait OutputLine: Send + Sync {
    fn set(&self, on: bool) -> io::Result<()>;
}

/// Output line requested through the GPIO character device.
#[cfg(feature = "gpio")]
pub struct GpioLine {
    lines: std::sync::Mutex<gpiod::Lines<gpiod::Output>>,
}

#[cfg(feature = "gpio")]
impl GpioLine {
    /// Request `offset` on `chip_name` as an output, driven low.
    pub fn request(chip_name: &str, offset: u32) -> io::Result<Self> {
        let chip = gpiod::Chip::new(chip_name)?;
        let options = gpiod::Options::output([offset])
            .values([false])
            .consumer("camstream-flash");
        let lines = chip.request_lines(options)?;
        Ok(Self {
            lines: std::sync::Mutex::new(lines),
        })
    }
}

#[cfg(feature = "gpio")]
impl OutputLine for GpioLine {
    fn set(&self, on: bool) -> io::Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_values([on])
    }
}

/// Auxiliary output line next to the sensor. Not part of sensor state.
pub struct Illuminator {
    line: Option<Box<dyn OutputLine>>,
    lit: AtomicBool,
}

impl Illuminator {
    /// Request the configured line once. The flash starts dark.
    pub fn new(config: &IlluminatorConfig) -> Result<Self> {
        let Some(chip) = &config.gpio_chip else {
            return Ok(Self::in_memory());
        };

        let line = Self::request(chip, config.gpio_line).map_err(|source| {
            CamError::Illuminator {
                chip: chip.clone(),
                line: config.gpio_line,
                source,
            }
        })?;
        info!(chip = %chip, line = config.gpio_line, "Illuminator line requested");
        Ok(Self::with_line(line))
    }

    #[cfg(feature = "gpio")]
    fn request(chip: &str, offset: u32) -> io::Result<Box<dyn OutputLine>> {
        Ok(Box::new(GpioLine::request(chip, offset)?))
    }

    #[cfg(not(feature = "gpio"))]
    fn request(_chip: &str, _offset: u32) -> io::Result<Box<dyn OutputLine>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "built without the gpio feature",
        ))
    }

    /// No hardware behind it; only the requested state is tracked.
    pub fn in_memory() -> Self {
        Self {
            line: None,
            lit: AtomicBool::new(false),
        }
    }

    /// Wrap an already-configured line, assumed to be off.
    pub fn with_line(line: Box<dyn OutputLine>) -> Self {
        Self {
            line: Some(line),
            lit: AtomicBool::new(false),
        }
    }

    /// Drive the line. On failure the recorded state is left unchanged.
    pub fn set(&self, on: bool) -> io::Result<()> {
        if let Some(line) = &self.line {
            line.set(on)?;
        }
        self.lit.store(on, Ordering::Relaxed);
        debug!(on, "Illuminator switched");
        Ok(())
    }

    pub fn is_on(&self) -> bool {
        self.lit.load(Ordering::Relaxed)
    }
}

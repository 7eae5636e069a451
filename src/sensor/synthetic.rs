//! Test-pattern sensor for running without camera hardware

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tracing::warn;

use crate::capture::{Frame, FrameMetadata};
use crate::error::Result;
use crate::sensor::{jpeg_quality, DeviceDescriptor, SensorConfig, SensorDevice, SensorState};

/// Renders a moving colour-bar pattern and encodes it as JPEG.
///
/// Honours frame size, quality, brightness, contrast, saturation and
/// mirror/flip from the shared [`SensorState`].
pub struct SyntheticSensor {
    descriptor: DeviceDescriptor,
    state: Arc<SensorState>,
    sequence: AtomicU64,
    outstanding: AtomicU64,
}

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

impl SyntheticSensor {
    pub fn new(descriptor: DeviceDescriptor, state: Arc<SensorState>) -> Self {
        Self {
            descriptor,
            state,
            sequence: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
        }
    }

    /// Frames handed out and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn render(config: &SensorConfig, sequence: u64) -> Result<Vec<u8>> {
        let (width, height) = config.frame_size.dimensions();
        let shift = (sequence as u32).wrapping_mul(4) % width.max(1);
        let bar_width = (width / BARS.len() as u32).max(1);

        let brightness = config.brightness as i32 * 24;
        let contrast = 1.0 + config.contrast as f32 * 0.2;
        let saturation = 1.0 + config.saturation as f32 * 0.25;

        let image = RgbImage::from_fn(width, height, |x, y| {
            let x = if config.hmirror { width - 1 - x } else { x };
            let y = if config.vflip { height - 1 - y } else { y };

            let bar = ((x + shift) % width / bar_width) as usize % BARS.len();
            let [r, g, b] = BARS[bar];
            // Darken toward the bottom so vflip is visible
            let fade = 1.0 - (y as f32 / height as f32) * 0.5;

            let luma = (r as f32 + g as f32 + b as f32) / 3.0;
            let adjust = |c: u8| {
                let c = c as f32 * fade;
                let c = luma * fade + (c - luma * fade) * saturation;
                let c = (c - 128.0) * contrast + 128.0 + brightness as f32;
                c.clamp(0.0, 255.0) as u8
            };
            Rgb([adjust(r), adjust(g), adjust(b)])
        });

        let mut jpeg = Vec::with_capacity((width * height / 4) as usize);
        JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality(config.quality)).encode_image(&image)?;
        Ok(jpeg)
    }
}

impl SensorDevice for SyntheticSensor {
    fn capture(&self) -> Option<Frame> {
        let config = *self.state.load();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        match Self::render(&config, sequence) {
            Ok(jpeg) => {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                Some(Frame::new(
                    Bytes::from(jpeg),
                    FrameMetadata {
                        sequence,
                        frame_size: config.frame_size,
                        device_timestamp: None,
                    },
                ))
            }
            Err(e) => {
                warn!("Synthetic frame encoding failed: {}", e);
                None
            }
        }
    }

    fn release(&self, _frame: Frame) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

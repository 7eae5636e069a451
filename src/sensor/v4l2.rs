//! V4L2 MJPEG sensor with memory-mapped buffers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{Frame, FrameMetadata};
use crate::error::{CamError, Result};
use crate::sensor::{jpeg_quality, DeviceDescriptor, SensorConfig, SensorDevice, SensorState};

const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_AUTOGAIN: u32 = 0x0098_0912;
const CID_GAIN: u32 = 0x0098_0913;
const CID_HFLIP: u32 = 0x0098_0914;
const CID_VFLIP: u32 = 0x0098_0915;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;

// V4L2_EXPOSURE_AUTO / V4L2_EXPOSURE_MANUAL menu entries
const EXPOSURE_AUTO: i64 = 0;
const EXPOSURE_MANUAL: i64 = 1;

/// MJPEG capture from a V4L2 node.
///
/// Settings are applied lazily: each capture compares the shared
/// [`SensorState`] with what was last pushed to the driver and reconfigures
/// only when they differ.
pub struct V4l2Sensor {
    descriptor: DeviceDescriptor,
    state: Arc<SensorState>,
    inner: Mutex<Inner>,
}

struct Inner {
    device: Device,
    stream: Option<MmapStream<'static>>,
    /// (min, max) of each integer control the driver exposes
    ranges: HashMap<u32, (i64, i64)>,
    applied: Option<SensorConfig>,
    sequence: u64,
}

impl V4l2Sensor {
    pub fn open(descriptor: DeviceDescriptor, state: Arc<SensorState>) -> Result<Self> {
        info!("Initializing V4L2 sensor: {:?}", descriptor);

        let init_err = |reason: String| CamError::SensorInit {
            device: descriptor.path.clone(),
            reason,
        };

        let device = Device::with_path(&descriptor.path).map_err(|e| init_err(e.to_string()))?;

        let caps = device.query_caps().map_err(|e| init_err(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(init_err("device doesn't support video capture".into()));
        }

        let mjpeg = FourCC::new(b"MJPG");
        let formats = device.enum_formats().map_err(|e| init_err(e.to_string()))?;
        if !formats.iter().any(|f| f.fourcc == mjpeg) {
            return Err(init_err("device has no MJPEG output".into()));
        }

        let ranges = device
            .query_controls()
            .map(|controls| {
                controls
                    .into_iter()
                    .map(|c| (c.id, (c.minimum as i64, c.maximum as i64)))
                    .collect()
            })
            .unwrap_or_default();

        let mut inner = Inner {
            device,
            stream: None,
            ranges,
            applied: None,
            sequence: 0,
        };

        // Fail now rather than on the first capture if the initial setup is rejected.
        let initial = *state.load();
        inner
            .apply(&initial, descriptor.buffer_count)
            .map_err(|e| init_err(e.to_string()))?;

        Ok(Self {
            descriptor,
            state,
            inner: Mutex::new(inner),
        })
    }
}

impl Inner {
    fn apply(&mut self, config: &SensorConfig, buffer_count: u32) -> std::io::Result<()> {
        let size_changed = self
            .applied
            .map_or(true, |prev| prev.frame_size != config.frame_size);

        if size_changed || self.stream.is_none() {
            // Buffers must be released before the format can change.
            self.stream = None;

            let (width, height) = config.frame_size.dimensions();
            let mut fmt = self.device.format()?;
            fmt.width = width;
            fmt.height = height;
            fmt.fourcc = FourCC::new(b"MJPG");
            self.device.set_format(&fmt)?;

            let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, buffer_count)?;
            self.stream = Some(stream);
            info!(
                "Capture stream started at {}x{} with {} buffers",
                width, height, buffer_count
            );
        }

        self.apply_controls(config);
        self.applied = Some(*config);
        Ok(())
    }

    fn apply_controls(&self, config: &SensorConfig) {
        let controls = [
            (CID_BRIGHTNESS, self.scaled(CID_BRIGHTNESS, config.brightness)),
            (CID_CONTRAST, self.scaled(CID_CONTRAST, config.contrast)),
            (CID_SATURATION, self.scaled(CID_SATURATION, config.saturation)),
            (CID_AUTO_WHITE_BALANCE, Some(config.awb as i64)),
            (
                CID_EXPOSURE_AUTO,
                Some(if config.aec { EXPOSURE_AUTO } else { EXPOSURE_MANUAL }),
            ),
            (CID_EXPOSURE_ABSOLUTE, Some(config.aec_value as i64)),
            (CID_AUTOGAIN, Some(config.agc as i64)),
            (CID_GAIN, Some(config.agc_gain as i64)),
            (CID_HFLIP, Some(config.hmirror as i64)),
            (CID_VFLIP, Some(config.vflip as i64)),
            (
                CID_JPEG_COMPRESSION_QUALITY,
                Some(jpeg_quality(config.quality) as i64),
            ),
        ];

        for (id, value) in controls {
            let Some(value) = value else { continue };
            if !self.ranges.contains_key(&id) {
                continue;
            }
            let control = Control {
                id,
                value: Value::Integer(value),
            };
            if let Err(e) = self.device.set_control(control) {
                debug!("Control {:#x} rejected: {}", id, e);
            }
        }
    }

    /// Maps a -2..=2 bias onto the driver's range for `id`.
    fn scaled(&self, id: u32, bias: i8) -> Option<i64> {
        let (min, max) = *self.ranges.get(&id)?;
        Some(min + (bias as i64 + 2) * (max - min) / 4)
    }
}

impl SensorDevice for V4l2Sensor {
    #[instrument(skip(self))]
    fn capture(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let config = *self.state.load();
        if inner.applied != Some(config) {
            if let Err(e) = inner.apply(&config, self.descriptor.buffer_count) {
                warn!("Failed to apply sensor settings: {}", e);
                return None;
            }
        }

        let frame_size = config.frame_size;
        let stream = inner.stream.as_mut()?;

        let (data, device_timestamp) = match stream.next() {
            Ok((buf, meta)) => (
                // Copy out so the mmap'd buffer can be requeued immediately
                Bytes::copy_from_slice(buf),
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
            Err(e) => {
                debug!("Dequeue failed: {}", e);
                return None;
            }
        };

        if data.is_empty() {
            return None;
        }

        inner.sequence += 1;

        Some(Frame::new(
            data,
            FrameMetadata {
                sequence: inner.sequence,
                frame_size,
                device_timestamp: Some(device_timestamp),
            },
        ))
    }

    fn release(&self, frame: Frame) {
        // The driver buffer was requeued on copy; only the heap copy is left.
        drop(frame);
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

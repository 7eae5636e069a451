//! Image sensor abstraction
//!
//! A [`SensorDevice`] hands out compressed JPEG frames and takes them back.
//! Runtime-tunable parameters live in a shared [`SensorState`]; the device
//! reads it lazily on every capture, so a settings write is picked up by the
//! next frame without any coordination with the capture path.

pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::capture::Frame;
use crate::error::Result;

pub use synthetic::SyntheticSensor;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Sensor;

/// Hardware abstraction consumed by the capture service.
///
/// `capture` returning `None` is a transient miss, never an error. Every
/// frame handed out must come back through `release` exactly once.
pub trait SensorDevice: Send + Sync {
    fn capture(&self) -> Option<Frame>;

    fn release(&self, frame: Frame);

    fn descriptor(&self) -> &DeviceDescriptor;
}

/// Enumerated capture resolutions, indexed 0..=12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSize {
    #[serde(rename = "96x96")]
    R96x96,
    Qqvga,
    Qcif,
    Hqvga,
    #[serde(rename = "240x240")]
    R240x240,
    Qvga,
    Cif,
    Hvga,
    Vga,
    Svga,
    Xga,
    Hd,
    Sxga,
}

impl FrameSize {
    pub const ALL: [FrameSize; 13] = [
        FrameSize::R96x96,
        FrameSize::Qqvga,
        FrameSize::Qcif,
        FrameSize::Hqvga,
        FrameSize::R240x240,
        FrameSize::Qvga,
        FrameSize::Cif,
        FrameSize::Hvga,
        FrameSize::Vga,
        FrameSize::Svga,
        FrameSize::Xga,
        FrameSize::Hd,
        FrameSize::Sxga,
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FrameSize::R96x96 => (96, 96),
            FrameSize::Qqvga => (160, 120),
            FrameSize::Qcif => (176, 144),
            FrameSize::Hqvga => (240, 176),
            FrameSize::R240x240 => (240, 240),
            FrameSize::Qvga => (320, 240),
            FrameSize::Cif => (400, 296),
            FrameSize::Hvga => (480, 320),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Hd => (1280, 720),
            FrameSize::Sxga => (1280, 1024),
        }
    }
}

/// Runtime-mutable sensor parameters. Last write wins, no history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub frame_size: FrameSize,
    /// 10..=63, smaller means higher quality
    pub quality: u8,
    pub brightness: i8,
    pub contrast: i8,
    pub saturation: i8,
    /// Auto white balance
    pub awb: bool,
    /// Auto exposure; `aec_value` is used when disabled
    pub aec: bool,
    pub aec_value: u16,
    /// Auto gain; `agc_gain` is used when disabled
    pub agc: bool,
    pub agc_gain: u8,
    pub hmirror: bool,
    pub vflip: bool,
    pub lens_correction: bool,
    pub bad_pixel_correction: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            frame_size: FrameSize::Vga,
            quality: 12,
            brightness: 0,
            contrast: 0,
            saturation: 0,
            awb: true,
            aec: true,
            aec_value: 300,
            agc: true,
            agc_gain: 0,
            hmirror: false,
            vflip: false,
            lens_correction: true,
            bad_pixel_correction: true,
        }
    }
}

/// Maps the 10..=63 sensor quality scale onto a 1..=100 JPEG encoder quality.
pub fn jpeg_quality(quality: u8) -> u8 {
    let q = quality.clamp(10, 63) as u32;
    (95 - (q - 10) * 85 / 53) as u8
}

/// Shared, lock-free holder for the current [`SensorConfig`].
///
/// Writers swap in a whole new value per parameter; readers get whatever
/// was stored last. There is no atomicity across several writes.
#[derive(Debug)]
pub struct SensorState {
    current: ArcSwap<SensorConfig>,
}

impl SensorState {
    pub fn new(initial: SensorConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<SensorConfig> {
        self.current.load_full()
    }

    pub fn update(&self, mut f: impl FnMut(&mut SensorConfig)) {
        self.current.rcu(|current| {
            let mut next = SensorConfig::clone(current);
            f(&mut next);
            next
        });
    }
}

impl Default for SensorState {
    fn default() -> Self {
        Self::new(SensorConfig::default())
    }
}

/// Immutable description of the capture hardware, consumed once when the
/// device is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDescriptor {
    /// Device node; empty means auto-detect
    pub path: String,
    pub buffer_count: u32,
    /// Largest resolution the sensor can deliver
    pub max_frame_size: FrameSize,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            path: "/dev/video0".into(),
            buffer_count: 4,
            max_frame_size: FrameSize::Sxga,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorBackend {
    V4l2,
    Synthetic,
}

impl Default for SensorBackend {
    fn default() -> Self {
        if cfg!(feature = "v4l2") {
            SensorBackend::V4l2
        } else {
            SensorBackend::Synthetic
        }
    }
}

fn open_backend(
    backend: SensorBackend,
    descriptor: &DeviceDescriptor,
    state: &Arc<SensorState>,
) -> Result<Arc<dyn SensorDevice>> {
    match backend {
        SensorBackend::Synthetic => Ok(Arc::new(SyntheticSensor::new(
            descriptor.clone(),
            state.clone(),
        ))),
        #[cfg(feature = "v4l2")]
        SensorBackend::V4l2 => Ok(Arc::new(V4l2Sensor::open(
            descriptor.clone(),
            state.clone(),
        )?)),
        #[cfg(not(feature = "v4l2"))]
        SensorBackend::V4l2 => Err(crate::error::CamError::SensorInit {
            device: descriptor.path.clone(),
            reason: "built without the v4l2 feature".into(),
        }),
    }
}

/// Brings the sensor up, tearing it down and retrying once on failure.
///
/// A second failure is returned as-is; the caller is expected to end the
/// process, since driver state can no longer be trusted.
pub fn open(
    backend: SensorBackend,
    descriptor: &DeviceDescriptor,
    state: &Arc<SensorState>,
) -> Result<Arc<dyn SensorDevice>> {
    match open_backend(backend, descriptor, state) {
        Ok(sensor) => {
            info!(?backend, device = %descriptor.path, "Sensor initialized");
            Ok(sensor)
        }
        Err(e) => {
            warn!(error = %e, "Sensor init failed, re-initializing once");
            open_backend(backend, descriptor, state).map_err(|e| {
                error!(error = %e, "Sensor re-initialization failed");
                e
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_index_round_trip() {
        for (i, size) in FrameSize::ALL.iter().enumerate() {
            assert_eq!(size.index(), i);
            assert_eq!(FrameSize::from_index(i as i64), Some(*size));
        }
        assert_eq!(FrameSize::from_index(13), None);
        assert_eq!(FrameSize::from_index(-1), None);
    }

    #[test]
    fn jpeg_quality_is_monotonic_and_bounded() {
        assert_eq!(jpeg_quality(10), 95);
        assert_eq!(jpeg_quality(63), 10);
        let mut last = u8::MAX;
        for q in 10..=63 {
            let mapped = jpeg_quality(q);
            assert!(mapped <= last);
            last = mapped;
        }
    }

    #[test]
    fn state_update_is_visible_to_next_load() {
        let state = SensorState::default();
        let before = state.load();
        state.update(|cfg| cfg.quality = 40);
        assert_eq!(before.quality, 12);
        assert_eq!(state.load().quality, 40);
    }

    #[test]
    fn synthetic_backend_opens_without_hardware() {
        let state = Arc::new(SensorState::default());
        let sensor = open(
            SensorBackend::Synthetic,
            &DeviceDescriptor::default(),
            &state,
        )
        .unwrap();
        assert_eq!(sensor.descriptor().max_frame_size, FrameSize::Sxga);
    }
}

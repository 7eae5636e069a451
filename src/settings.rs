//! Settings controller: validated, per-parameter writes into sensor state

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::illuminator::Illuminator;
use crate::sensor::{FrameSize, SensorState};

pub const QUALITY_RANGE: std::ops::RangeInclusive<i64> = 10..=63;
pub const BIAS_RANGE: std::ops::RangeInclusive<i64> = -2..=2;
pub const AEC_VALUE_RANGE: std::ops::RangeInclusive<i64> = 0..=1200;
pub const AGC_GAIN_RANGE: std::ops::RangeInclusive<i64> = 0..=30;

/// A single validated parameter change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    FrameSize(FrameSize),
    Quality(u8),
    Brightness(i8),
    Contrast(i8),
    Saturation(i8),
    HMirror(bool),
    VFlip(bool),
    Awb(bool),
    Aec(bool),
    AecValue(u16),
    Agc(bool),
    AgcGain(u8),
    LensCorrection(bool),
    BadPixelCorrection(bool),
    Flash(bool),
}

impl Setting {
    /// Parse and range-check one `name=value` pair.
    ///
    /// `max_frame_size` caps the resolution at what the sensor can deliver.
    /// Unknown names, non-integers and out-of-range values yield `None`.
    pub fn parse(name: &str, raw: &str, max_frame_size: FrameSize) -> Option<Self> {
        let value: i64 = raw.trim().parse().ok()?;
        let within = |range: std::ops::RangeInclusive<i64>| range.contains(&value).then_some(value);
        let flag = || match value {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };

        let setting = match name {
            "framesize" => {
                let size = FrameSize::from_index(value)?;
                if size > max_frame_size {
                    return None;
                }
                Setting::FrameSize(size)
            }
            "quality" => Setting::Quality(within(QUALITY_RANGE)? as u8),
            "brightness" => Setting::Brightness(within(BIAS_RANGE)? as i8),
            "contrast" => Setting::Contrast(within(BIAS_RANGE)? as i8),
            "saturation" => Setting::Saturation(within(BIAS_RANGE)? as i8),
            "hmirror" => Setting::HMirror(flag()?),
            "vflip" => Setting::VFlip(flag()?),
            "awb" => Setting::Awb(flag()?),
            "aec" => Setting::Aec(flag()?),
            "aec_value" => Setting::AecValue(within(AEC_VALUE_RANGE)? as u16),
            "agc" => Setting::Agc(flag()?),
            "agc_gain" => Setting::AgcGain(within(AGC_GAIN_RANGE)? as u8),
            "lenc" => Setting::LensCorrection(flag()?),
            "bpc" => Setting::BadPixelCorrection(flag()?),
            "flash" => Setting::Flash(flag()?),
            _ => return None,
        };
        Some(setting)
    }
}

/// Applies parameter changes to the shared sensor state and the illuminator.
///
/// Each parameter is validated and written independently; there is no
/// rollback, so a request may be partially applied.
pub struct SettingsController {
    sensor: Arc<SensorState>,
    illuminator: Arc<Illuminator>,
    max_frame_size: FrameSize,
}

impl SettingsController {
    pub fn new(
        sensor: Arc<SensorState>,
        illuminator: Arc<Illuminator>,
        max_frame_size: FrameSize,
    ) -> Self {
        Self {
            sensor,
            illuminator,
            max_frame_size,
        }
    }

    /// Apply every recognised pair. Returns `true` if at least one was applied.
    pub fn apply<'a, I>(&self, params: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        params
            .into_iter()
            .fold(false, |applied, (name, raw)| self.apply_one(name, raw) || applied)
    }

    /// Apply a single pair. Invalid input, or a flash line that cannot be
    /// driven, leaves all state untouched.
    pub fn apply_one(&self, name: &str, raw: &str) -> bool {
        let Some(setting) = Setting::parse(name, raw, self.max_frame_size) else {
            debug!(name, raw, "Ignoring invalid setting");
            return false;
        };

        match setting {
            Setting::Flash(on) => {
                if let Err(e) = self.illuminator.set(on) {
                    warn!(on, "Failed to drive illuminator: {}", e);
                    return false;
                }
            }
            other => self.sensor.update(|cfg| match other {
                Setting::FrameSize(v) => cfg.frame_size = v,
                Setting::Quality(v) => cfg.quality = v,
                Setting::Brightness(v) => cfg.brightness = v,
                Setting::Contrast(v) => cfg.contrast = v,
                Setting::Saturation(v) => cfg.saturation = v,
                Setting::HMirror(v) => cfg.hmirror = v,
                Setting::VFlip(v) => cfg.vflip = v,
                Setting::Awb(v) => cfg.awb = v,
                Setting::Aec(v) => cfg.aec = v,
                Setting::AecValue(v) => cfg.aec_value = v,
                Setting::Agc(v) => cfg.agc = v,
                Setting::AgcGain(v) => cfg.agc_gain = v,
                Setting::LensCorrection(v) => cfg.lens_correction = v,
                Setting::BadPixelCorrection(v) => cfg.bad_pixel_correction = v,
                Setting::Flash(_) => {}
            }),
        }

        info!(?setting, "Setting applied");
        metrics::counter!("camstream_settings_applied_total").increment(1);
        true
    }
}

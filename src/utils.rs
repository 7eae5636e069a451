use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub mjpeg: bool,
}

/// Every V4L2 capture node on the host, MJPEG-capable or not
pub fn list_devices() -> Vec<FoundDevice> {
    use std::path::Path;

    let mut found = Vec::new();
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Check for capture capability
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let mjpeg = dev
            .enum_formats()
            .map(|formats| formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")))
            .unwrap_or(false);

        found.push(FoundDevice {
            path,
            card: caps.card,
            mjpeg,
        });
    }
    found
}

/// Auto-detect the first capture device that can emit MJPEG
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let device = list_devices()
        .into_iter()
        .find(|d| d.mjpeg)
        .ok_or_else(|| eyre!("No MJPEG capture device found"))?;

    info!("Found MJPEG device: {} - {}", device.path, device.card);
    Ok(device)
}

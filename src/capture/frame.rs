use bytes::Bytes;
use std::time::{Duration, Instant};

use crate::sensor::FrameSize;

/// One compressed JPEG image from the sensor.
///
/// Deliberately not `Clone`: a frame is owned by exactly one holder between
/// acquisition and release.
#[derive(Debug)]
pub struct Frame {
    /// Immutable JPEG bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub frame_size: FrameSize,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta,
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

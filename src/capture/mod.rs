pub mod frame;
pub mod service;

pub use frame::{Frame, FrameMetadata};
pub use service::{CaptureCounts, CaptureService, FrameLease};

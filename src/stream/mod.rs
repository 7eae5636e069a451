//! Motion-JPEG streaming: multipart framing and per-client sessions

pub mod multipart;
pub mod session;

pub use session::{
    CloseReason, SessionGuard, SessionManager, SessionState, SessionSummary, StreamConfig,
    StreamSession,
};

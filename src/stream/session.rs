//! Per-client stream sessions and the connection counters they maintain

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureService;
use crate::stream::multipart;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Delay after each delivered frame; caps the frame rate
    pub pacing_ms: u64,
    /// Close the session after this many back-to-back capture misses (0 = never)
    pub max_consecutive_misses: u32,
    /// Encoded parts buffered between a session and its socket
    pub queue_depth: usize,
    /// Refuse a second stream while one is active
    pub exclusive: bool,
    /// Interval between per-session throughput log lines
    pub report_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pacing_ms: 30, // ~33 fps ceiling
            max_consecutive_misses: 50,
            queue_depth: 2,
            exclusive: false,
            report_interval_ms: 5000,
        }
    }
}

/// Process-wide connection counters.
///
/// `total` only ever grows. `admitted` covers every session from Opening to
/// Closed and is what exclusivity is checked against; `streaming` only counts
/// sessions in the Streaming state.
#[derive(Debug, Default)]
pub struct SessionManager {
    total: AtomicU64,
    admitted: AtomicUsize,
    streaming: AtomicUsize,
    exclusive: bool,
}

impl SessionManager {
    pub fn new(exclusive: bool) -> Self {
        Self {
            exclusive,
            ..Self::default()
        }
    }

    /// Admit a new session, or `None` when running exclusive and busy.
    pub fn open(self: &Arc<Self>) -> Option<SessionGuard> {
        if self.exclusive {
            self.admitted
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .ok()?;
        } else {
            self.admitted.fetch_add(1, Ordering::AcqRel);
        }
        let id = self.total.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!("camstream_sessions_total").increment(1);

        Some(SessionGuard {
            manager: self.clone(),
            id,
            streaming: false,
        })
    }

    pub fn total_connections(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Sessions currently in the Streaming state.
    pub fn active_sessions(&self) -> usize {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active_sessions() > 0
    }
}

/// Proof of admission. Dropping it marks the session closed.
#[derive(Debug)]
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    id: u64,
    streaming: bool,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Count this session as streaming. Idempotent.
    pub fn begin_streaming(&mut self) {
        if !self.streaming {
            self.streaming = true;
            self.manager.streaming.fetch_add(1, Ordering::AcqRel);
            metrics::gauge!("camstream_sessions_active").increment(1.0);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Free the admission slot first: once `is_active` reads false a new
        // exclusive session must be admissible.
        self.manager.admitted.fetch_sub(1, Ordering::AcqRel);
        if self.streaming {
            self.manager.streaming.fetch_sub(1, Ordering::AcqRel);
            metrics::gauge!("camstream_sessions_active").decrement(1.0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away
    PeerGone,
    /// Too many consecutive capture misses
    SensorStalled,
    /// The server is shutting down
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSummary {
    pub id: u64,
    pub frames: u64,
    pub reason: CloseReason,
}

/// One client's live stream.
///
/// The session pulls frames from the [`CaptureService`], encodes each into a
/// multipart part and pushes it into a bounded channel whose receiver is the
/// HTTP response body. A dropped receiver is how a disconnect shows up.
pub struct StreamSession {
    guard: SessionGuard,
    capture: Arc<CaptureService>,
    config: StreamConfig,
    peer: Option<SocketAddr>,
    state: SessionState,
}

impl StreamSession {
    pub fn new(
        guard: SessionGuard,
        capture: Arc<CaptureService>,
        config: StreamConfig,
        peer: Option<SocketAddr>,
    ) -> Self {
        info!(session = guard.id(), ?peer, "Stream session opened");
        Self {
            guard,
            capture,
            config,
            peer,
            state: SessionState::Opening,
        }
    }

    pub fn id(&self) -> u64 {
        self.guard.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stream until the peer disconnects, the sensor stalls or `shutdown`
    /// is cancelled.
    ///
    /// An acquisition in progress is allowed to finish so its frame is
    /// released; cancellation is observed between frames, while handing a
    /// part to the queue and during pacing.
    pub async fn run(mut self, tx: Sender<Bytes>, shutdown: CancellationToken) -> SessionSummary {
        self.guard.begin_streaming();
        self.state = SessionState::Streaming;

        let pacing = Duration::from_millis(self.config.pacing_ms);
        let report_every = Duration::from_millis(self.config.report_interval_ms);
        let mut frames = 0u64;
        let mut misses = 0u32;
        let mut window_frames = 0u64;
        let mut window_start = Instant::now();

        let reason = loop {
            if tx.is_disconnected() {
                break CloseReason::PeerGone;
            }
            if shutdown.is_cancelled() {
                break CloseReason::Shutdown;
            }

            let Some(frame) = self.capture.acquire().await else {
                misses += 1;
                if self.config.max_consecutive_misses > 0
                    && misses >= self.config.max_consecutive_misses
                {
                    warn!(session = self.id(), misses, "Sensor stalled, closing stream");
                    break CloseReason::SensorStalled;
                }
                continue;
            };
            misses = 0;

            let part = multipart::encode_part(&frame.data);
            // On either early exit the lease drops, so the frame still goes
            // back to the sensor.
            tokio::select! {
                sent = tx.send_async(part) => {
                    if sent.is_err() {
                        break CloseReason::PeerGone;
                    }
                }
                _ = shutdown.cancelled() => break CloseReason::Shutdown,
            }
            drop(frame);

            frames += 1;
            window_frames += 1;
            let elapsed = window_start.elapsed();
            if elapsed >= report_every {
                info!(
                    session = self.id(),
                    peer = ?self.peer,
                    fps = window_frames as f64 / elapsed.as_secs_f64(),
                    "Streaming"
                );
                window_frames = 0;
                window_start = Instant::now();
            }

            tokio::select! {
                _ = tokio::time::sleep(pacing) => {}
                _ = shutdown.cancelled() => break CloseReason::Shutdown,
            }
        };

        self.close(frames, reason)
    }

    fn close(mut self, frames: u64, reason: CloseReason) -> SessionSummary {
        self.state = SessionState::Closed;
        debug!(session = self.id(), ?reason, "Session state -> {:?}", self.state);
        info!(session = self.id(), frames, ?reason, "Stream session closed");
        SessionSummary {
            id: self.id(),
            frames,
            reason,
        }
        // `self.guard` drops with `self`, clearing the active flag.
    }
}

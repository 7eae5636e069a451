//! Capture service: acquire/release contract around the sensor

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

use crate::capture::Frame;
use crate::sensor::SensorDevice;

/// Serialises access to one sensor and turns misses into a paced retry.
pub struct CaptureService {
    sensor: Arc<dyn SensorDevice>,
    /// Only one acquisition in flight at a time
    turn: Mutex<()>,
    miss_delay: Duration,
    stats: Arc<CachePadded<CaptureStats>>,
}

/// Lifetime counters. `acquired - released` is the number of frames
/// currently out on loan.
#[derive(Debug, Default)]
pub struct CaptureStats {
    acquired: AtomicU64,
    released: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCounts {
    pub acquired: u64,
    pub released: u64,
    pub misses: u64,
}

impl CaptureCounts {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

impl CaptureService {
    pub fn new(sensor: Arc<dyn SensorDevice>, miss_delay: Duration) -> Self {
        Self {
            sensor,
            turn: Mutex::new(()),
            miss_delay,
            stats: Arc::new(CachePadded::new(CaptureStats::default())),
        }
    }

    /// Acquire one frame.
    ///
    /// On a miss this waits `miss_delay` before returning `None`, so callers
    /// can simply loop. The returned lease releases the frame when dropped.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Option<FrameLease> {
        let turn = self.turn.lock().await;
        let sensor = self.sensor.clone();
        let captured = match tokio::task::spawn_blocking(move || sensor.capture()).await {
            Ok(frame) => frame,
            Err(e) => {
                error!("Sensor capture task failed: {}", e);
                None
            }
        };
        drop(turn);

        match captured {
            Some(frame) => {
                self.stats.acquired.fetch_add(1, Ordering::Release);
                metrics::counter!("camstream_frames_captured_total").increment(1);
                Some(FrameLease {
                    frame: Some(frame),
                    sensor: self.sensor.clone(),
                    stats: self.stats.clone(),
                })
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camstream_capture_misses_total").increment(1);
                debug!("Sensor returned no frame, retrying in {:?}", self.miss_delay);
                tokio::time::sleep(self.miss_delay).await;
                None
            }
        }
    }

    /// Point-in-time counters. `released` is read first so a concurrent
    /// acquire/release pair cannot make it exceed `acquired`.
    pub fn counts(&self) -> CaptureCounts {
        let released = self.stats.released.load(Ordering::Acquire);
        let acquired = self.stats.acquired.load(Ordering::Acquire);
        CaptureCounts {
            acquired,
            released,
            misses: self.stats.misses.load(Ordering::Relaxed),
        }
    }
}

/// A frame on loan from the [`CaptureService`].
///
/// Dropping the lease hands the frame back to the sensor, so release happens
/// exactly once on every path, including early returns and failed writes.
pub struct FrameLease {
    frame: Option<Frame>,
    sensor: Arc<dyn SensorDevice>,
    stats: Arc<CachePadded<CaptureStats>>,
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only `drop` takes the frame out.
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease used after release"),
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.sensor.release(frame);
            self.stats.released.fetch_add(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMetadata;
    use crate::sensor::{DeviceDescriptor, FrameSize};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct Scripted {
        descriptor: DeviceDescriptor,
        script: StdMutex<VecDeque<Option<&'static [u8]>>>,
        released: AtomicU64,
    }

    impl Scripted {
        fn new(script: Vec<Option<&'static [u8]>>) -> Self {
            Self {
                descriptor: DeviceDescriptor::default(),
                script: StdMutex::new(script.into()),
                released: AtomicU64::new(0),
            }
        }
    }

    impl SensorDevice for Scripted {
        fn capture(&self) -> Option<Frame> {
            let next = self.script.lock().unwrap().pop_front().flatten()?;
            Some(Frame::new(
                Bytes::from_static(next),
                FrameMetadata {
                    sequence: 0,
                    frame_size: FrameSize::Vga,
                    device_timestamp: None,
                },
            ))
        }

        fn release(&self, _frame: Frame) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn descriptor(&self) -> &DeviceDescriptor {
            &self.descriptor
        }
    }

    #[tokio::test]
    async fn lease_releases_exactly_once() {
        let sensor = Arc::new(Scripted::new(vec![Some(&b"abc"[..]), Some(&b"defg"[..])]));
        let service = CaptureService::new(sensor.clone(), Duration::from_millis(1));

        let first = service.acquire().await.unwrap();
        assert_eq!(&first.data[..], b"abc");
        assert_eq!(service.counts().outstanding(), 1);
        drop(first);

        let second = service.acquire().await.unwrap();
        assert_eq!(second.len(), 4);
        drop(second);

        let counts = service.counts();
        assert_eq!(counts.acquired, 2);
        assert_eq!(counts.released, 2);
        assert_eq!(sensor.released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn miss_waits_then_returns_none() {
        let sensor = Arc::new(Scripted::new(vec![None, Some(&b"x"[..])]));
        let service = CaptureService::new(sensor, Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        assert!(service.acquire().await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));

        assert!(service.acquire().await.is_some());
        let counts = service.counts();
        assert_eq!(counts.misses, 1);
        assert_eq!(counts.outstanding(), 0);
    }

    #[test]
    fn outstanding_saturates_on_torn_snapshot() {
        let torn = CaptureCounts {
            acquired: 5,
            released: 6,
            misses: 0,
        };
        assert_eq!(torn.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn counts_stay_consistent_under_churn() {
        let sensor = Arc::new(Scripted::new(vec![Some(&b"f"[..]); 2000]));
        let service = Arc::new(CaptureService::new(sensor, Duration::from_millis(1)));

        let churn = {
            let service = service.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    drop(service.acquire().await);
                }
            })
        };
        while !churn.is_finished() {
            let counts = service.counts();
            assert!(counts.released <= counts.acquired);
            tokio::task::yield_now().await;
        }
        churn.await.unwrap();
        assert_eq!(service.counts().outstanding(), 0);
    }
}

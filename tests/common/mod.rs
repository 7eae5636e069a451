#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camstream::capture::{CaptureService, Frame, FrameMetadata};
use camstream::error::Result;
use camstream::illuminator::Illuminator;
use camstream::sensor::{DeviceDescriptor, FrameSize, SensorDevice, SensorState};
use camstream::server::{self, AppState};
use camstream::settings::SettingsController;
use camstream::status::StatusReporter;
use camstream::stream::{SessionManager, StreamConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Produces numbered frames forever; payload length varies with the number.
pub struct CountingSensor {
    descriptor: DeviceDescriptor,
    next: AtomicU64,
    pub released: AtomicU64,
}

impl CountingSensor {
    pub fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor::default(),
            next: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn payload(sequence: u64) -> Vec<u8> {
        let mut data = format!("frame-{sequence:06}|").into_bytes();
        data.resize(64 + (sequence as usize * 37) % 500, b'#');
        data
    }
}

impl SensorDevice for CountingSensor {
    fn capture(&self) -> Option<Frame> {
        let sequence = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Some(Frame::new(
            Bytes::from(Self::payload(sequence)),
            FrameMetadata {
                sequence,
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

/// Never produces a frame.
pub struct StalledSensor {
    descriptor: DeviceDescriptor,
    pub attempts: AtomicU64,
}

impl StalledSensor {
    pub fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor::default(),
            attempts: AtomicU64::new(0),
        }
    }
}

impl SensorDevice for StalledSensor {
    fn capture(&self) -> Option<Frame> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        None
    }

    fn release(&self, _frame: Frame) {
        unreachable!("no frame was ever handed out");
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

pub struct TestApp<S = CountingSensor> {
    pub addr: SocketAddr,
    pub sensor: Arc<S>,
    pub sensor_state: Arc<SensorState>,
    pub capture: Arc<CaptureService>,
    pub sessions: Arc<SessionManager>,
    pub illuminator: Arc<Illuminator>,
    /// Fires the server's shutdown future
    pub stop: Option<oneshot::Sender<()>>,
    pub server: JoinHandle<Result<()>>,
}

pub fn fast_stream_config() -> StreamConfig {
    StreamConfig {
        pacing_ms: 2,
        max_consecutive_misses: 0,
        queue_depth: 2,
        exclusive: false,
        report_interval_ms: 5000,
    }
}

pub async fn spawn_app(stream: StreamConfig) -> TestApp {
    spawn_app_with(Arc::new(CountingSensor::new()), stream).await
}

pub async fn spawn_app_with<S: SensorDevice + 'static>(
    sensor: Arc<S>,
    stream: StreamConfig,
) -> TestApp<S> {
    let sensor_state = Arc::new(SensorState::default());
    let capture = Arc::new(CaptureService::new(sensor.clone(), Duration::from_millis(5)));
    let sessions = Arc::new(SessionManager::new(stream.exclusive));
    let illuminator = Arc::new(Illuminator::in_memory());

    let state = AppState {
        capture: capture.clone(),
        sessions: sessions.clone(),
        settings: Arc::new(SettingsController::new(
            sensor_state.clone(),
            illuminator.clone(),
            FrameSize::Sxga,
        )),
        status: Arc::new(StatusReporter::new(sessions.clone())),
        stream,
        shutdown: CancellationToken::new(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(server::serve(listener, state, async move {
        let _ = stopped.await;
    }));

    TestApp {
        addr,
        sensor,
        sensor_state,
        capture,
        sessions,
        illuminator,
        stop: Some(stop),
        server,
    }
}

pub struct HttpResponse {
    pub status: u16,
    /// Raw header block, lowercased
    pub head: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(raw: &[u8]) -> (u16, String) {
    let head = String::from_utf8_lossy(raw).to_ascii_lowercase();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    (status, head)
}

/// One-shot HTTP/1.0 GET; reads until the server closes.
pub async fn get(addr: SocketAddr, path: &str) -> HttpResponse {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(format!("GET {path} HTTP/1.0\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let split = find(&raw, b"\r\n\r\n").unwrap();
    let (status, head) = parse_head(&raw[..split]);
    HttpResponse {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    }
}

/// An open `/stream` connection with its unread body bytes.
pub struct StreamClient {
    pub status: u16,
    pub head: String,
    socket: TcpStream,
    buffer: Vec<u8>,
}

impl StreamClient {
    pub async fn open(addr: SocketAddr) -> Self {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"GET /stream HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut buffer = Vec::new();
        let split = loop {
            if let Some(split) = find(&buffer, b"\r\n\r\n") {
                break split;
            }
            Self::fill(&mut socket, &mut buffer).await;
        };
        let (status, head) = parse_head(&buffer[..split]);
        buffer.drain(..split + 4);

        Self {
            status,
            head,
            socket,
            buffer,
        }
    }

    async fn fill(socket: &mut TcpStream, buffer: &mut Vec<u8>) {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed by server");
        buffer.extend_from_slice(&chunk[..n]);
    }

    /// Drain the rest of the body until the server closes the connection.
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut rest = std::mem::take(&mut self.buffer);
        tokio::time::timeout(Duration::from_secs(5), self.socket.read_to_end(&mut rest))
            .await
            .expect("stream did not end")
            .unwrap();
        rest
    }

    async fn need(&mut self, len: usize) {
        while self.buffer.len() < len {
            Self::fill(&mut self.socket, &mut self.buffer).await;
        }
    }

    /// Read one part, checking the framing byte for byte, and return its payload.
    pub async fn next_part(&mut self) -> Vec<u8> {
        let header_end = loop {
            if let Some(pos) = find(&self.buffer, b"\r\n\r\n") {
                break pos;
            }
            Self::fill(&mut self.socket, &mut self.buffer).await;
        };

        let header = String::from_utf8(self.buffer[..header_end].to_vec()).unwrap();
        let mut lines = header.split("\r\n");
        assert_eq!(lines.next(), Some("--frame"));
        assert_eq!(lines.next(), Some("Content-Type: image/jpeg"));
        let length: usize = lines
            .next()
            .and_then(|l| l.strip_prefix("Content-Length: "))
            .and_then(|n| n.parse().ok())
            .unwrap();
        assert_eq!(lines.next(), None);

        let body_start = header_end + 4;
        self.need(body_start + length + 2).await;
        let payload = self.buffer[body_start..body_start + length].to_vec();
        assert_eq!(&self.buffer[body_start + length..body_start + length + 2], b"\r\n");
        self.buffer.drain(..body_start + length + 2);
        payload
    }
}

/// Poll `check` every 10 ms for up to 5 s.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

//! HTTP surface: control page, MJPEG stream, status and settings

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::CaptureService;
use crate::error::Result;
use crate::settings::SettingsController;
use crate::status::{StatusBody, StatusReporter};
use crate::stream::{multipart, SessionManager, StreamConfig, StreamSession};

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub capture: Arc<CaptureService>,
    pub sessions: Arc<SessionManager>,
    pub settings: Arc<SettingsController>,
    pub status: Arc<StatusReporter>,
    pub stream: StreamConfig,
    /// Cancelled when the server starts shutting down; ends every stream
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route("/status", get(status))
        .route("/settings", get(settings))
        .route("/capture", get(capture))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
///
/// Resolving `shutdown` also cancels `state.shutdown`, so open streams end
/// and graceful shutdown can complete.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("HTTP server listening on {}", listener.local_addr()?);
    let sessions = state.shutdown.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Closing open streams");
        sessions.cancel();
    })
    .await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn stream(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(guard) = state.sessions.open() else {
        warn!(%peer, "Refusing stream, another session is active");
        return (StatusCode::SERVICE_UNAVAILABLE, "stream busy\n").into_response();
    };

    let (tx, rx) = flume::bounded::<Bytes>(state.stream.queue_depth.max(1));
    let session = StreamSession::new(guard, state.capture.clone(), state.stream.clone(), Some(peer));
    tokio::spawn(session.run(tx, state.shutdown.clone()));

    let body = Body::from_stream(rx.into_stream().map(Ok::<Bytes, Infallible>));
    (
        [
            (header::CONTENT_TYPE, multipart::STREAM_CONTENT_TYPE),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let body = StatusBody::from(state.status.snapshot());
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(body)).into_response()
}

async fn settings(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    // The flash write is a device call; keep it off the async workers.
    let settings = state.settings.clone();
    let applied = tokio::task::spawn_blocking(move || {
        settings.apply(params.iter().map(|(name, raw)| (name.as_str(), raw.as_str())))
    })
    .await;
    let applied = match applied {
        Ok(applied) => applied,
        Err(e) => {
            error!("Settings task failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "settings failed\n").into_response();
        }
    };
    let reply = if applied { "updated" } else { "no change" };
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], reply).into_response()
}

/// Single JPEG snapshot through the same acquire/release contract.
async fn capture(State(state): State<AppState>) -> Response {
    let attempts = state.stream.max_consecutive_misses.max(1);
    for _ in 0..attempts {
        if let Some(frame) = state.capture.acquire().await {
            let jpeg = Bytes::copy_from_slice(&frame.data);
            drop(frame);
            return (
                [
                    (header::CONTENT_TYPE, multipart::PART_CONTENT_TYPE),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                jpeg,
            )
                .into_response();
        }
    }
    (StatusCode::SERVICE_UNAVAILABLE, "no frame from sensor\n").into_response()
}


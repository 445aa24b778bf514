//! HTTP surface: the live MJPEG feed and a JSON status endpoint.

use crate::manager::{SessionError, SessionManager, SessionStatus};
use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const MJPEG_BOUNDARY: &str = "frame";

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    /// Who opened the feed, recorded if this starts a session.
    actor: Option<String>,
}

pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/video_feed", get(video_feed))
        .route("/status", get(status))
        .with_state(AppState { manager })
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind HTTP listener on {addr}"))?;
    tracing::info!(%addr, "HTTP surface listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn video_feed(State(state): State<AppState>, Query(params): Query<FeedParams>) -> Response {
    let manager = Arc::clone(&state.manager);
    let subscribed = tokio::task::spawn_blocking(move || manager.subscribe(params.actor)).await;

    let frames = match subscribed {
        Ok(Ok(rx)) => rx,
        Ok(Err(SessionError::DeviceUnavailable(e))) => {
            tracing::warn!(error = %e, "video feed refused");
            return (StatusCode::SERVICE_UNAVAILABLE, "Camera not available").into_response();
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "video feed failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Video feed error").into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "video feed task failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Video feed error").into_response();
        }
    };

    let parts = ReceiverStream::new(frames).map(|jpeg| Ok::<_, Infallible>(mjpeg_part(&jpeg)));
    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(parts))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "cannot build video feed response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.manager.status())
}

/// One multipart section carrying a JPEG frame.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let head = format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

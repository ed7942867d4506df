//! The HTTP surface of the streaming server.
//!
//! `GET /` serves the viewer page and `GET /stream_video_file` serves the
//! MJPEG stream. Each stream request opens its own video source; the only
//! shared state is the immutable configuration and the open-source gauge.

use crate::config::StreamConfig;
use crate::multipart::STREAM_CONTENT_TYPE;
use crate::streamer;
use crate::video_source::ActiveSources;
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

const INDEX_HTML: &str = include_str!("../templates/streaming_template.html");

/// Path of the stream endpoint.
pub const STREAM_PATH: &str = "/stream_video_file";

/// State shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<StreamConfig>,
    active: ActiveSources,
}

impl AppState {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config: Arc::new(config),
            active: ActiveSources::new(),
        }
    }

    /// Gauge of video sources currently held open by streams.
    pub fn active_sources(&self) -> &ActiveSources {
        &self.active
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(STREAM_PATH, get(stream_video_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Returns the main page, with the MJPEG stream embedded.
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Returns a response streaming JPEG frames from the video.
async fn stream_video_file(State(state): State<AppState>) -> impl IntoResponse {
    info!(
        "Starting stream of {} ({} sources already open)",
        state.config.video_path,
        state.active.count()
    );
    let body = Body::from_stream(streamer::stream(&state.config, &state.active));
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        body,
    )
}

/// Serves `state` on `listener` until `shutdown` resolves.
///
/// Open streams are not drained on shutdown; they end when the runtime does.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let server = axum::serve(listener, router(state)).into_future();
    tokio::select! {
        result = server => result.context("HTTP server failed"),
        _ = shutdown => {
            info!("Shutdown requested, stopping server.");
            Ok(())
        }
    }
}

/// Binds the configured address and serves until Ctrl-C.
pub async fn run(config: StreamConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        "Server listening on http://{}/ (stream at {})",
        listener.local_addr()?,
        STREAM_PATH
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    serve(listener, AppState::new(config), shutdown).await
}

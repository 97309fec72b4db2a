//! HTTP endpoint serving the latest frame

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderName, HeaderValue},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{debug, info};

use crate::capture::PixelFormat;
use crate::pipeline::FramePublisher;

const FRAME_SEQUENCE_HEADER: &str = "x-frame-sequence";
/// Driver capture timestamp in microseconds, when the driver reports one
const FRAME_TIMESTAMP_HEADER: &str = "x-frame-timestamp";

#[derive(Clone)]
struct AppState {
    publisher: FramePublisher,
    content_type: HeaderValue,
}

/// Router with the single frame endpoint mounted at `path`.
pub fn router(publisher: FramePublisher, path: &str, format: PixelFormat) -> Router {
    let state = AppState {
        publisher,
        content_type: HeaderValue::from_static(format.mime_type()),
    };
    Router::new()
        .route(path, get(latest_frame))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Serving frames on http://{}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn latest_frame(State(state): State<AppState>) -> Response {
    match state.publisher.read_latest() {
        Ok(frame) => {
            metrics::counter!("camsnap_frames_served_total").increment(1);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, state.content_type.clone());
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            headers.insert(
                HeaderName::from_static(FRAME_SEQUENCE_HEADER),
                HeaderValue::from(frame.meta.sequence),
            );
            headers.insert(
                header::AGE,
                HeaderValue::from(frame.captured_at.elapsed().as_secs()),
            );
            if let Some(timestamp) = frame.meta.device_timestamp {
                headers.insert(
                    HeaderName::from_static(FRAME_TIMESTAMP_HEADER),
                    HeaderValue::from(timestamp.as_micros() as u64),
                );
            }
            // Cheap clone of the shared frame bytes
            (StatusCode::OK, headers, Body::from(frame.data.clone())).into_response()
        }
        Err(e) => {
            metrics::counter!("camsnap_frames_not_ready_total").increment(1);
            debug!("Request before first frame");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [
                    (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
                    (header::RETRY_AFTER, HeaderValue::from_static("1")),
                ],
                e.to_string(),
            )
                .into_response()
        }
    }
}

//! Request logging middleware: one structured `info!` per completed
//! request, method/path/status/latency.

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

pub async fn log_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let response = next.run(request).await;

    let elapsed = started_at.elapsed();
    let status = response.status();

    if status.is_server_error() {
        error!(%method, %path, %status, elapsed_ms = elapsed.as_millis(), "request failed");
    } else if status.is_client_error() {
        warn!(%method, %path, %status, elapsed_ms = elapsed.as_millis(), "request rejected");
    } else {
        info!(%method, %path, %status, elapsed_ms = elapsed.as_millis(), "request completed");
    }

    response
}

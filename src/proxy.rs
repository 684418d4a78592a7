use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::transport::RetryTransport;

/// Builds the per-listener router: every method and path is handed to the
/// retry transport, and response bytes are streamed back without
/// aggregation.
pub fn router(transport: Arc<RetryTransport>) -> Router {
    Router::new().fallback(forward).with_state(transport)
}

async fn forward(State(transport): State<Arc<RetryTransport>>, request: Request) -> Response {
    tracing::debug!(
        method = %request.method(),
        path = request.uri().path(),
        "incoming request"
    );

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match transport.round_trip(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, %method, path, "proxy error");
            (StatusCode::BAD_GATEWAY, format!("proxy error: {err}")).into_response()
        }
    }
}

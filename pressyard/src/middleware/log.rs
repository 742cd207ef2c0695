use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument as _;

pub async fn log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri_path = request.uri().path();

    let span = if uri_path.len() > 512 {
        // Truncate long URIs to keep the log readable.
        info_span!("request", %method, path = %&uri_path[..512])
    } else {
        info_span!("request", %method, path = %uri_path)
    };

    async move {
        let start_time = Instant::now();

        debug!("Received request");

        let response = next.run(request).await;

        info!(duration = ?start_time.elapsed(), status = %response.status());

        response
    }
    .instrument(span)
    .await
}

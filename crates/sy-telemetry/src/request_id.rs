use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

/// Generate a request id (32 hex characters).
pub fn generate_request_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Axum middleware that propagates `x-request-id` and wraps each request in
/// a tracing span.
///
/// An incoming `x-request-id` header is reused; otherwise a new id is
/// generated. The response always carries the header for correlation.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    if let Ok(val) = request_id.parse() {
        request.headers_mut().insert("x-request-id", val);
    }

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );
    let _guard = span.enter();

    let mut response = next.run(request).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert("x-request-id", val);
    }
    response
}

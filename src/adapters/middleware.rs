//! Axum middleware attached to every HTTP route.
//!
//! Stateless layers only: security headers, CORS for JSON-RPC POSTs and
//! request timing.
use axum::{
    extract::Request,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;

use crate::{metrics::RequestTimer, tracing_setup::create_request_span};

/// Log and measure every request.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let span = create_request_span(req.method().as_str(), req.uri().path());
    let mut timer = RequestTimer::new(req.uri().path());
    let started = std::time::Instant::now();

    span.in_scope(|| tracing::debug!("Started processing request"));
    let response = next.run(req).instrument(span.clone()).await;

    let status = response.status().as_u16();
    timer.set_status(status);
    span.record("http.status_code", status);
    span.record("duration_ms", started.elapsed().as_millis() as u64);
    span.in_scope(|| tracing::debug!("Completed request"));
    response
}

/// Add hardening headers to every response.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=(), payment=()"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

/// Permissive CORS for JSON-RPC over POST, reflecting the caller's origin.
pub async fn cors_middleware(req: Request, next: Next) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();

    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        origin.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));

    response
}

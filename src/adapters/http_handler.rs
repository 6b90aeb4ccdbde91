use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    adapters::{
        middleware::{cors_middleware, request_timing_middleware, security_headers_middleware},
        ws_session,
    },
    core::{
        GatewayService,
        admission::{AdmissionDecision, ip_list::normalize_ip},
        error::GatewayError,
        node::NodeAddress,
        rpc::{JsonRpcRequest, JsonRpcResponse, dispatcher::RequestContext},
    },
};

pub const SOFT_REJECT_MESSAGE: &str = "Network is currently busy. Please try again later.";
pub const HARD_REJECT_MESSAGE: &str = "Rejected by rate-limiting";

/// Remote address of the caller, normalized (IPv4-mapped IPv6 unwrapped).
#[derive(Debug, Clone, Copy)]
pub struct SourceIp(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for SourceIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Ok(SourceIp(normalize_ip(ip)))
    }
}

/// HTTP and WebSocket front door of the gateway.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    /// Build the axum router: JSON-RPC on `POST /`, WebSocket upgrade on
    /// `GET /`, plus the `/api` routes.
    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(websocket_upgrade).post(rpc_over_http))
            .route("/api/health", get(health))
            .route("/api/status", get(status))
            .route("/api/subscribe", get(node_subscribe))
            .layer(middleware::from_fn(cors_middleware))
            .layer(middleware::from_fn(security_headers_middleware))
            .layer(middleware::from_fn(request_timing_middleware))
            .with_state(self)
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

fn malformed_response(reason: &str) -> Response {
    let error = GatewayError::MalformedRequest(reason.to_string()).to_rpc_error();
    (
        StatusCode::BAD_REQUEST,
        Json(JsonRpcResponse::failure(serde_json::Value::Null, error)),
    )
        .into_response()
}

/// Run admission control; `Some` is the rejection to send instead of dispatching.
pub(crate) async fn admit(
    gateway: &GatewayService,
    source: IpAddr,
    request: &JsonRpcRequest,
) -> Option<&'static str> {
    let admission = gateway.admission();
    match admission.decide(source, request.method_name(), &request.params) {
        AdmissionDecision::Accept => None,
        AdmissionDecision::SoftReject => {
            tracing::debug!(%source, method = request.method_name(), "Soft-rejecting request");
            tokio::time::sleep(admission.soft_reject_delay()).await;
            Some(SOFT_REJECT_MESSAGE)
        }
        AdmissionDecision::Reject => {
            tracing::debug!(%source, method = request.method_name(), "Rejecting request");
            Some(HARD_REJECT_MESSAGE)
        }
    }
}

async fn rpc_over_http(
    State(handler): State<HttpHandler>,
    SourceIp(source): SourceIp,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(%source, error = %e, "Unparseable JSON-RPC body");
            return malformed_response("body is not a JSON-RPC request");
        }
    };
    if !request.is_well_formed() {
        return malformed_response("missing jsonrpc or id");
    }

    if let Some(rejection) = admit(&handler.gateway, source, &request).await {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, rejection);
    }

    let ctx = RequestContext::http(source);
    match handler
        .gateway
        .dispatcher()
        .dispatch(&ctx, &request)
        .await
        .into_reply()
    {
        Some(response) => Json(response).into_response(),
        // Only socket transports defer their replies.
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn websocket_upgrade(
    State(handler): State<HttpHandler>,
    SourceIp(source): SourceIp,
    ws: WebSocketUpgrade,
) -> Response {
    if !handler.gateway.config().websocket.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    let gateway = handler.gateway.clone();
    ws.on_upgrade(move |socket| ws_session::serve(socket, gateway, source))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "healthy": true }))
}

async fn status(State(handler): State<HttpHandler>) -> Response {
    Json(handler.gateway.status()).into_response()
}

#[derive(Debug, Deserialize)]
struct NodeSubscribeQuery {
    port: Option<u16>,
}

/// Whether the request carries the admin token, as a bearer token or the
/// `access_token` cookie.
fn is_authorized(headers: &HeaderMap, admin_token: Option<&str>) -> bool {
    let Some(expected) = admin_token.filter(|t| !t.is_empty()) else {
        return false;
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim());
    if bearer == Some(expected) {
        return true;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .any(|(name, value)| name == "access_token" && value == expected)
}

/// A node announces it serves this gateway's subscriptions.
async fn node_subscribe(
    State(handler): State<HttpHandler>,
    SourceIp(source): SourceIp,
    headers: HeaderMap,
    Query(query): Query<NodeSubscribeQuery>,
) -> Response {
    if !is_authorized(&headers, handler.gateway.config().admin_token.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "unauthorized" })),
        )
            .into_response();
    }

    let Some(port) = query.port else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid ip or port");
    };

    let node = NodeAddress::new(source.to_string(), port);
    if handler.gateway.nodes().mark_subscribed(&node, true).await {
        tracing::info!(node = %node, "Node subscription accepted");
        (StatusCode::OK, format!("Successfully changed to {node}")).into_response()
    } else {
        tracing::warn!(node = %node, "Node subscription rejected");
        (
            StatusCode::OK,
            format!("Ip not in the nodelist {node}, node subscription rejected"),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(name: header::HeaderName, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_bearer_token_authorizes() {
        assert!(is_authorized(
            &headers(header::AUTHORIZATION, "Bearer s3cret"),
            Some("s3cret")
        ));
        assert!(!is_authorized(
            &headers(header::AUTHORIZATION, "Bearer wrong"),
            Some("s3cret")
        ));
    }

    #[test]
    fn test_cookie_authorizes() {
        assert!(is_authorized(
            &headers(header::COOKIE, "theme=dark; access_token=s3cret"),
            Some("s3cret")
        ));
    }

    #[test]
    fn test_no_configured_token_denies() {
        assert!(!is_authorized(&headers(header::AUTHORIZATION, ""), None));
        assert!(!is_authorized(&headers(header::AUTHORIZATION, ""), Some("")));
    }
}

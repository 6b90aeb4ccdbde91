// JSON-RPC over HTTP and the /api routes, driven through the axum router
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use shardgate::{
    HttpHandler,
    adapters::http_handler::{HARD_REJECT_MESSAGE, SOFT_REJECT_MESSAGE},
    config::{GatewayConfig, RateLimitConfig},
    core::{GatewayService, NodeAddress},
    ports::backend_client::{BackendClient, BackendClientResult},
};
use tower::ServiceExt;

const CLIENT: ([u8; 4], u16) = ([198, 51, 100, 7], 40_000);

struct StaticBackend;

#[async_trait]
impl BackendClient for StaticBackend {
    async fn call(
        &self,
        _node: &NodeAddress,
        method: &str,
        _params: &Value,
    ) -> BackendClientResult<Value> {
        Ok(json!({ "echo": method }))
    }
}

fn gateway(config: GatewayConfig) -> Arc<GatewayService> {
    let gateway = GatewayService::new(Arc::new(config), Arc::new(StaticBackend), None).unwrap();
    gateway.nodes().refresh(vec![
        NodeAddress::new("10.0.0.1", 9001),
        NodeAddress::new("198.51.100.7", 9001),
    ]);
    Arc::new(gateway)
}

fn app(gateway: Arc<GatewayService>) -> Router {
    HttpHandler::new(gateway).router()
}

fn default_app() -> Router {
    app(gateway(
        GatewayConfig::builder()
            .seed_nodes(["10.0.0.1:9001"])
            .chain_id(8082)
            .build(),
    ))
}

fn with_client(mut request: Request<Body>, client: ([u8; 4], u16)) -> Request<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(client)));
    request
}

fn rpc_request(body: impl Into<Body>) -> Request<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap();
    with_client(request, CLIENT)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

#[tokio::test]
async fn local_method_is_answered() {
    let response = default_app()
        .oneshot(rpc_request(
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId", "params": []}).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"id": 1, "jsonrpc": "2.0", "result": "0x1f92"})
    );
}

#[tokio::test]
async fn proxied_method_reaches_backend() {
    let response = default_app()
        .oneshot(rpc_request(
            json!({"jsonrpc": "2.0", "id": "a", "method": "eth_getBalance", "params": ["0x0", "latest"]})
                .to_string(),
        ))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["id"], "a");
    assert_eq!(body["result"]["echo"], "eth_getBalance");
}

#[tokio::test]
async fn unknown_method_gets_json_rpc_error() {
    let response = default_app()
        .oneshot(rpc_request(
            json!({"jsonrpc": "2.0", "id": 9, "method": "eth_teleport", "params": []}).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"id": 9, "jsonrpc": "2.0", "error": {"message": "Method does not exist", "code": -1}})
    );
}

#[tokio::test]
async fn subscriptions_are_refused_over_http() {
    let response = default_app()
        .oneshot(rpc_request(
            json!({"jsonrpc": "2.0", "id": 2, "method": "eth_subscribe", "params": ["logs"]})
                .to_string(),
        ))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["id"], 2);
    assert_eq!(body["error"]["code"], -1);
    assert_eq!(
        body["error"]["message"],
        "Subscriptions are not supported on this transport"
    );
}

#[tokio::test]
async fn malformed_bodies_are_bad_requests() {
    for body in [
        "not json".to_string(),
        json!({"id": 1, "method": "eth_chainId"}).to_string(),
        json!({"jsonrpc": "2.0", "method": "eth_chainId"}).to_string(),
    ] {
        let response = default_app().oneshot(rpc_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], -1);
    }
}

#[tokio::test]
async fn blocked_source_gets_hard_reject() {
    let config = GatewayConfig::builder()
        .seed_nodes(["10.0.0.1:9001"])
        .rate_limit(RateLimitConfig {
            block_list: vec!["198.51.100.0/24".to_string()],
            ..RateLimitConfig::default()
        })
        .build();
    let response = app(gateway(config))
        .oneshot(rpc_request(
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId"}).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_string(response).await, HARD_REJECT_MESSAGE);
}

#[tokio::test]
async fn spammer_over_budget_gets_soft_reject() {
    let config = GatewayConfig::builder()
        .seed_nodes(["10.0.0.1:9001"])
        .rate_limit(RateLimitConfig {
            threshold: 1,
            window: "1h".to_string(),
            spammer_list: vec!["198.51.100.7".to_string()],
            soft_reject_min_delay_ms: 0,
            soft_reject_max_delay_ms: 0,
            ..RateLimitConfig::default()
        })
        .build();
    let app = app(gateway(config));
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId"}).to_string();

    let first = app.clone().oneshot(rpc_request(body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(rpc_request(body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_string(second).await, SOFT_REJECT_MESSAGE);
}

#[tokio::test]
async fn health_and_status_routes() {
    let app = default_app();

    let health = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(
        health.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(body_json(health).await, json!({"healthy": true}));

    let status = app
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = body_json(status).await;
    assert_eq!(status["nodes"], 2);
    assert_eq!(status["active_node"], "10.0.0.1:9001");
    assert_eq!(status["relay"], "disconnected");
}

fn subscribe_request(port: Option<u16>, token: Option<&str>) -> Request<Body> {
    let uri = match port {
        Some(port) => format!("/api/subscribe?port={port}"),
        None => "/api/subscribe".to_string(),
    };
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    with_client(builder.body(Body::empty()).unwrap(), CLIENT)
}

#[tokio::test]
async fn node_subscribe_requires_admin_token() {
    let response = default_app()
        .oneshot(subscribe_request(Some(9001), Some("anything")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await, json!({"message": "unauthorized"}));
}

#[tokio::test]
async fn node_subscribe_switches_active_node() {
    let gateway = gateway(
        GatewayConfig::builder()
            .seed_nodes(["10.0.0.1:9001"])
            .admin_token("s3cret")
            .build(),
    );
    let app = app(gateway.clone());

    let missing_port = app
        .clone()
        .oneshot(subscribe_request(None, Some("s3cret")))
        .await
        .unwrap();
    assert_eq!(missing_port.status(), StatusCode::BAD_REQUEST);

    let unknown = app
        .clone()
        .oneshot(subscribe_request(Some(9999), Some("s3cret")))
        .await
        .unwrap();
    assert!(body_string(unknown).await.contains("node subscription rejected"));
    assert_eq!(
        gateway.nodes().select_active().unwrap(),
        NodeAddress::new("10.0.0.1", 9001)
    );

    let accepted = app
        .oneshot(subscribe_request(Some(9001), Some("s3cret")))
        .await
        .unwrap();
    assert_eq!(
        body_string(accepted).await,
        "Successfully changed to 198.51.100.7:9001"
    );
    assert_eq!(
        gateway.nodes().select_active().unwrap(),
        NodeAddress::new("198.51.100.7", 9001)
    );
}

#[tokio::test]
async fn cors_preflight_is_answered() {
    let response = default_app()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/")
                .header(header::ORIGIN, "https://wallet.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "https://wallet.example"
    );
}

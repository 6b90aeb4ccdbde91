//! Shardgate - a JSON-RPC and WebSocket gateway in front of a sharded ledger network.
//!
//! Shardgate accepts Ethereum-style JSON-RPC calls over HTTP and WebSocket and
//! forwards them to one *active* node of a dynamic node set. It also relays
//! log subscriptions between many client sockets and a single upstream log
//! server. The crate follows a **hexagonal architecture**: `core` holds the
//! pure logic, `ports` the traits for external collaborators and `adapters`
//! their reqwest / tungstenite / axum implementations.
//!
//! # Components
//! - [`core::NodeRegistry`]: node set published as atomic snapshots, active
//!   node selection, probe and proxy-error bookkeeping
//! - [`core::AdmissionController`]: per-source weighted rate limiting with
//!   block and spammer lists and bounded memory
//! - [`core::SubscriptionRegistry`] and [`core::EventRelay`]: the log
//!   subscription index and the reconnecting upstream link
//! - [`core::RpcDispatcher`]: method table shared by both transports
//! - [`adapters::HttpHandler`]: the axum router serving it all
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use shardgate::{GatewayService, adapters::HttpBackendClient, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(load_config("config.toml").await?);
//! let backend = Arc::new(HttpBackendClient::new(&config.backend)?);
//! let gateway = Arc::new(GatewayService::new(config, backend, None)?);
//! let app = shardgate::adapters::HttpHandler::new(gateway).router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-path failures are [`core::GatewayError`] values that become
//! JSON-RPC error payloads. Startup and configuration use `eyre::Result`
//! with `WrapErr` context.
//!
//! # Concurrency
//! The node set lives behind `arc_swap::ArcSwap`, so readers never see a
//! half-applied refresh. Subscription state sits behind a single mutex owned
//! by the relay.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{
        HttpBackendClient, HttpCollector, HttpHandler, HttpNodeDiscovery, LogTxStatusSink,
        MaintenanceTasks, WsUpstreamConnector,
    },
    core::GatewayService,
    utils::GracefulShutdown,
};

pub mod collector;
pub mod http_client;
pub mod http_handler;
pub mod maintenance;
pub mod middleware;
pub mod node_discovery;
pub mod tx_status_log;
pub mod upstream_ws;
pub mod ws_session;

/// Re-export commonly used types from adapters
pub use collector::HttpCollector;
pub use http_client::HttpBackendClient;
pub use http_handler::HttpHandler;
pub use maintenance::MaintenanceTasks;
pub use node_discovery::HttpNodeDiscovery;
pub use tx_status_log::LogTxStatusSink;
pub use upstream_ws::WsUpstreamConnector;

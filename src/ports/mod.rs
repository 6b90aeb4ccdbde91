pub mod backend_client;
pub mod collector;
pub mod node_discovery;
pub mod tx_status_sink;
pub mod upstream;

pub use backend_client::{BackendClient, BackendClientError, BackendClientResult};
pub use collector::{Collector, CollectorError};
pub use node_discovery::{DiscoveryError, NodeDiscovery};
pub use tx_status_sink::{TxStatus, TxStatusSink};
pub use upstream::{UpstreamConnector, UpstreamError, UpstreamLink};

pub mod admission;
pub mod error;
pub mod gateway;
pub mod node;
pub mod node_registry;
pub mod node_selection;
pub mod relay;
pub mod rpc;
pub mod subscription;
pub mod tx_status;

pub use admission::{AdmissionController, AdmissionDecision};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{GatewayService, GatewayStatus};
pub use node::{NodeAddress, NodeHealth};
pub use node_registry::NodeRegistry;
pub use relay::{EventRelay, LinkState};
pub use rpc::{RpcDispatcher, RpcHandler};
pub use subscription::{ClientHandle, SubscriptionId, SubscriptionRegistry};

//! Internal records (`core.apinet.ironcore.dev/v1alpha1`).
//!
//! These are the records the datapath fleet watches. They are produced by
//! the apinetlet translation layer and by the apinet controllers.

pub mod affinity;
pub mod daemon_set;
pub mod instance;
pub mod ip;
pub mod ip_address;
pub mod load_balancer;
pub mod nat_gateway;
pub mod network;
pub mod network_id;
pub mod network_interface;
pub mod network_policy;
pub mod node;

pub use affinity::*;
pub use daemon_set::*;
pub use instance::*;
pub use ip::*;
pub use ip_address::*;
pub use load_balancer::*;
pub use nat_gateway::*;
pub use network::*;
pub use network_id::*;
pub use network_interface::*;
pub use network_policy::*;
pub use node::*;

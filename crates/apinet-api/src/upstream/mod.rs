//! Upstream records (`networking.ironcore.dev/v1alpha1` and
//! `ipam.ironcore.dev/v1alpha1`) consumed by the apinetlet.

pub mod load_balancer;
pub mod nat_gateway;
pub mod network;
pub mod network_interface;
pub mod network_policy;
pub mod prefix;
pub mod virtual_ip;

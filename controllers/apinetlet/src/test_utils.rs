//! Test utilities for unit testing the translators
//!
//! [`TestEnv`] wires a [`Reconciler`] to in-memory upstream and internal
//! stores and keeps handles on them so tests can seed and inspect both
//! sides.

use apinet_api::internal as apinet;
use apinet_api::provider_id::make_network_id;
use apinet_api::upstream::load_balancer::{LoadBalancer, LoadBalancerRouting};
use apinet_api::upstream::nat_gateway::NATGateway;
use apinet_api::upstream::network::{Network, NetworkSpec};
use apinet_api::upstream::network_interface::NetworkInterface;
use apinet_api::upstream::network_policy::NetworkPolicy;
use apinet_api::upstream::prefix::Prefix;
use apinet_api::upstream::virtual_ip::VirtualIP;
use apinet_client::{MockClient, ResourceClient, ResourceObject};
use kube::api::ObjectMeta;
use serde_json::json;
use std::sync::Arc;

use crate::config::{Config, DEFAULT_NAT_GATEWAY_MAX_PUBLIC_IPS};
use crate::reconciler::{ApinetClients, Reconciler, UpstreamClients};

/// Upstream namespace of every fixture.
pub const NAMESPACE: &str = "default";

/// Internal-store namespace translated records land in.
pub const APINET_NAMESPACE: &str = "apinet";

/// Upstream stores.
pub struct Upstream {
    pub networks: Arc<MockClient<Network>>,
    pub network_interfaces: Arc<MockClient<NetworkInterface>>,
    pub virtual_ips: Arc<MockClient<VirtualIP>>,
    pub load_balancers: Arc<MockClient<LoadBalancer>>,
    pub load_balancer_routings: Arc<MockClient<LoadBalancerRouting>>,
    pub nat_gateways: Arc<MockClient<NATGateway>>,
    pub network_policies: Arc<MockClient<NetworkPolicy>>,
    pub prefixes: Arc<MockClient<Prefix>>,
}

/// Internal stores.
pub struct Apinet {
    pub networks: Arc<MockClient<apinet::Network>>,
    pub ips: Arc<MockClient<apinet::IP>>,
    pub network_interfaces: Arc<MockClient<apinet::NetworkInterface>>,
    pub load_balancers: Arc<MockClient<apinet::LoadBalancer>>,
    pub load_balancer_routings: Arc<MockClient<apinet::LoadBalancerRouting>>,
    pub nat_gateways: Arc<MockClient<apinet::NATGateway>>,
    pub nat_gateway_autoscalers: Arc<MockClient<apinet::NATGatewayAutoscaler>>,
    pub nat_tables: Arc<MockClient<apinet::NATTable>>,
    pub network_policies: Arc<MockClient<apinet::NetworkPolicy>>,
}

/// A reconciler over in-memory stores.
pub struct TestEnv {
    pub upstream: Upstream,
    pub apinet: Apinet,
    pub reconciler: Reconciler,
}

fn dyn_client<K: ResourceObject>(mock: &Arc<MockClient<K>>) -> Arc<dyn ResourceClient<K>> {
    Arc::clone(mock) as Arc<dyn ResourceClient<K>>
}

pub fn config() -> Config {
    Config {
        apinet_namespace: APINET_NAMESPACE.to_string(),
        upstream_namespace: None,
        apinet_kubeconfig: None,
        nat_gateway_max_public_ips: DEFAULT_NAT_GATEWAY_MAX_PUBLIC_IPS,
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: Config) -> Self {
        let upstream = Upstream {
            networks: Arc::new(MockClient::new()),
            network_interfaces: Arc::new(MockClient::new()),
            virtual_ips: Arc::new(MockClient::new()),
            load_balancers: Arc::new(MockClient::new()),
            load_balancer_routings: Arc::new(MockClient::new()),
            nat_gateways: Arc::new(MockClient::new()),
            network_policies: Arc::new(MockClient::new()),
            prefixes: Arc::new(MockClient::new()),
        };
        let apinet = Apinet {
            networks: Arc::new(MockClient::new()),
            ips: Arc::new(MockClient::new()),
            network_interfaces: Arc::new(MockClient::new()),
            load_balancers: Arc::new(MockClient::new()),
            load_balancer_routings: Arc::new(MockClient::new()),
            nat_gateways: Arc::new(MockClient::new()),
            nat_gateway_autoscalers: Arc::new(MockClient::new()),
            nat_tables: Arc::new(MockClient::new()),
            network_policies: Arc::new(MockClient::new()),
        };

        let upstream_clients = UpstreamClients {
            networks: dyn_client(&upstream.networks),
            network_interfaces: dyn_client(&upstream.network_interfaces),
            virtual_ips: dyn_client(&upstream.virtual_ips),
            load_balancers: dyn_client(&upstream.load_balancers),
            load_balancer_routings: dyn_client(&upstream.load_balancer_routings),
            nat_gateways: dyn_client(&upstream.nat_gateways),
            network_policies: dyn_client(&upstream.network_policies),
            prefixes: dyn_client(&upstream.prefixes),
        };
        let apinet_clients = ApinetClients {
            networks: dyn_client(&apinet.networks),
            ips: dyn_client(&apinet.ips),
            network_interfaces: dyn_client(&apinet.network_interfaces),
            load_balancers: dyn_client(&apinet.load_balancers),
            load_balancer_routings: dyn_client(&apinet.load_balancer_routings),
            nat_gateways: dyn_client(&apinet.nat_gateways),
            nat_gateway_autoscalers: dyn_client(&apinet.nat_gateway_autoscalers),
            nat_tables: dyn_client(&apinet.nat_tables),
            network_policies: dyn_client(&apinet.network_policies),
        };

        Self {
            upstream,
            apinet,
            reconciler: Reconciler::new(config, upstream_clients, apinet_clients),
        }
    }

    /// Seeds an upstream network already backed by an internal network
    /// with `vni`, as a completed translation leaves it.
    pub async fn add_ready_network(&self, name: &str, vni: u32) -> (Network, apinet::Network) {
        let upstream = self.upstream.networks.add(network(name)).unwrap();
        let internal = self
            .apinet
            .networks
            .add(apinet::Network {
                metadata: apinet_meta(&uid(&upstream)),
                spec: apinet::NetworkSpec {
                    id: Some(vni.to_string()),
                    peerings: Vec::new(),
                },
                status: None,
            })
            .unwrap();
        let provider_id = make_network_id(APINET_NAMESPACE, &uid(&upstream), vni, &uid(&internal));
        let upstream = self
            .upstream
            .networks
            .patch(Some(NAMESPACE), name, &json!({ "spec": { "providerId": provider_id } }))
            .await
            .unwrap();
        (upstream, internal)
    }
}

/// Upstream metadata in [`NAMESPACE`].
pub fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

/// Internal metadata in [`APINET_NAMESPACE`].
pub fn apinet_meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(APINET_NAMESPACE.to_string()),
        ..Default::default()
    }
}

pub fn network(name: &str) -> Network {
    Network {
        metadata: meta(name),
        spec: NetworkSpec::default(),
        status: None,
    }
}

/// uid of a stored object.
pub fn uid<K: ResourceObject>(obj: &K) -> String {
    obj.meta().uid.clone().unwrap()
}

/// Current state of `obj` in `store`.
pub fn fetch<K: ResourceObject>(store: &MockClient<K>, obj: &K) -> K {
    store
        .object(obj.meta().namespace.as_deref(), obj.meta().name.as_deref().unwrap())
        .unwrap()
}

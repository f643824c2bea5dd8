//! Test utilities for unit testing reconcilers
//!
//! [`TestEnv`] wires a [`Reconciler`] to one in-memory store per kind and
//! keeps handles on the stores so tests can seed and inspect them.

use apinet_api::internal::{
    Affinity, DaemonSet, DaemonSetSpec, IP, IPAddress, Instance, InstanceSpec, InstanceTemplate, LoadBalancer,
    LoadBalancerSpec, NATGateway, NATGatewayAutoscaler, NATGatewaySpec, NATTable, Network, NetworkID,
    NetworkInterface, NetworkInterfaceSpec, NetworkPolicy, NetworkPolicyRule, NetworkSpec, Node, NodeSpec,
    PublicIPRequest,
};
use apinet_api::selector::LabelSelector;
use apinet_api::{IPFamily, LoadBalancerType, LocalObjectReference};
use apinet_client::{MockClient, ResourceClient, ResourceObject};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::RecordingEventPublisher;
use crate::reconciler::certificate::RecordingCsrApproval;
use crate::reconciler::{Clients, Reconciler};

/// Namespace every fixture lives in.
pub const NAMESPACE: &str = "apinet";

/// A reconciler over in-memory stores.
pub struct TestEnv {
    pub networks: Arc<MockClient<Network>>,
    pub network_ids: Arc<MockClient<NetworkID>>,
    pub ips: Arc<MockClient<IP>>,
    pub ip_addresses: Arc<MockClient<IPAddress>>,
    pub network_interfaces: Arc<MockClient<NetworkInterface>>,
    pub load_balancers: Arc<MockClient<LoadBalancer>>,
    pub nat_gateways: Arc<MockClient<NATGateway>>,
    pub nat_tables: Arc<MockClient<NATTable>>,
    pub nat_gateway_autoscalers: Arc<MockClient<NATGatewayAutoscaler>>,
    pub network_policies: Arc<MockClient<NetworkPolicy>>,
    pub network_policy_rules: Arc<MockClient<NetworkPolicyRule>>,
    pub daemon_sets: Arc<MockClient<DaemonSet>>,
    pub instances: Arc<MockClient<Instance>>,
    pub nodes: Arc<MockClient<Node>>,
    pub events: Arc<RecordingEventPublisher>,
    pub csr_approval: Arc<RecordingCsrApproval>,
    pub reconciler: Reconciler,
}

fn dyn_client<K: ResourceObject>(mock: &Arc<MockClient<K>>) -> Arc<dyn ResourceClient<K>> {
    Arc::clone(mock) as Arc<dyn ResourceClient<K>>
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let networks = Arc::new(MockClient::new());
        let network_ids = Arc::new(MockClient::new());
        let ips = Arc::new(MockClient::new());
        let ip_addresses = Arc::new(MockClient::new());
        let network_interfaces = Arc::new(MockClient::new());
        let load_balancers = Arc::new(MockClient::new());
        let nat_gateways = Arc::new(MockClient::new());
        let nat_tables = Arc::new(MockClient::new());
        let nat_gateway_autoscalers = Arc::new(MockClient::new());
        let network_policies = Arc::new(MockClient::new());
        let network_policy_rules = Arc::new(MockClient::new());
        let daemon_sets = Arc::new(MockClient::new());
        let instances = Arc::new(MockClient::new());
        let nodes = Arc::new(MockClient::new());
        let events = Arc::new(RecordingEventPublisher::default());
        let csr_approval = Arc::new(RecordingCsrApproval::default());

        let clients = Clients {
            networks: dyn_client(&networks),
            network_ids: dyn_client(&network_ids),
            ips: dyn_client(&ips),
            ip_addresses: dyn_client(&ip_addresses),
            network_interfaces: dyn_client(&network_interfaces),
            load_balancers: dyn_client(&load_balancers),
            nat_gateways: dyn_client(&nat_gateways),
            nat_tables: dyn_client(&nat_tables),
            nat_gateway_autoscalers: dyn_client(&nat_gateway_autoscalers),
            network_policies: dyn_client(&network_policies),
            network_policy_rules: dyn_client(&network_policy_rules),
            daemon_sets: dyn_client(&daemon_sets),
            instances: dyn_client(&instances),
            nodes: dyn_client(&nodes),
            csr_approval: Arc::clone(&csr_approval) as Arc<_>,
        };
        let reconciler = Reconciler::new(
            config,
            clients,
            Arc::clone(&events) as Arc<_>,
            CancellationToken::new(),
        )
        .unwrap();

        Self {
            networks,
            network_ids,
            ips,
            ip_addresses,
            network_interfaces,
            load_balancers,
            nat_gateways,
            nat_tables,
            nat_gateway_autoscalers,
            network_policies,
            network_policy_rules,
            daemon_sets,
            instances,
            nodes,
            events,
            csr_approval,
            reconciler,
        }
    }

    /// Creates `node` and feeds it to the scheduler cache.
    pub async fn add_node(&self, node: Node) -> Node {
        let node = self.nodes.create(None, &node).await.unwrap();
        self.reconciler.node_observed(node.clone());
        node
    }
}

pub fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
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

pub fn node(name: &str, labels: BTreeMap<String, String>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: NodeSpec {},
    }
}

pub fn network_interface(name: &str, network: &str, node: &str, ips: &[&str]) -> NetworkInterface {
    NetworkInterface {
        metadata: meta(name),
        spec: NetworkInterfaceSpec {
            network_ref: LocalObjectReference::new(network),
            node_ref: LocalObjectReference::new(node),
            ips: ips.iter().filter_map(|ip| ip.parse::<IpAddr>().ok()).collect(),
            ..Default::default()
        },
        status: None,
    }
}

pub fn load_balancer(name: &str, network: &str, ips: Vec<PublicIPRequest>) -> LoadBalancer {
    LoadBalancer {
        metadata: meta(name),
        spec: LoadBalancerSpec {
            type_: LoadBalancerType::Public,
            network_ref: LocalObjectReference::new(network),
            ips,
            ports: Vec::new(),
            selector: None,
            template: InstanceTemplate {
                metadata: Default::default(),
                spec: InstanceSpec {
                    network_ref: LocalObjectReference::new(network),
                    ..Default::default()
                },
            },
        },
        status: None,
    }
}

pub fn nat_gateway(name: &str, network: &str, family: IPFamily, ports: i32) -> NATGateway {
    NATGateway {
        metadata: meta(name),
        spec: NATGatewaySpec {
            ip_family: family,
            network_ref: LocalObjectReference::new(network),
            ips: Vec::new(),
            ports_per_network_interface: ports,
        },
        status: None,
    }
}

/// Daemon set selecting `app=<name>`, optionally restricted by node
/// affinity.
pub fn daemon_set(name: &str, affinity: Option<Affinity>) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    DaemonSet {
        metadata: meta(name),
        spec: DaemonSetSpec {
            selector: LabelSelector::from_labels(labels.clone()),
            template: InstanceTemplate {
                metadata: apinet_api::internal::TemplateMetadata {
                    labels,
                    annotations: BTreeMap::new(),
                },
                spec: InstanceSpec {
                    network_ref: LocalObjectReference::new("net"),
                    affinity,
                    ..Default::default()
                },
            },
        },
        status: None,
    }
}

//! Prints every CRD of the internal store as a multi-document YAML stream.

use apinet_api::internal::{
    DaemonSet, IP, IPAddress, Instance, LoadBalancer, LoadBalancerRouting, NATGateway, NATGatewayAutoscaler,
    NATTable, Network, NetworkID, NetworkInterface, NetworkPolicy, NetworkPolicyRule, Node,
};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Network::crd(),
        NetworkID::crd(),
        IP::crd(),
        IPAddress::crd(),
        NetworkInterface::crd(),
        LoadBalancer::crd(),
        LoadBalancerRouting::crd(),
        NATGateway::crd(),
        NATTable::crd(),
        NATGatewayAutoscaler::crd(),
        NetworkPolicy::crd(),
        NetworkPolicyRule::crd(),
        DaemonSet::crd(),
        Instance::crd(),
        Node::crd(),
    ];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}

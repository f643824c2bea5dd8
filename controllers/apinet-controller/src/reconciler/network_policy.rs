//! Network policies: resolve selectors into a `NetworkPolicyRule`.
//!
//! The rule carries the concrete addresses the datapath enforces. Targets
//! are the interfaces of the policy's network selected by
//! `networkInterfaceSelector`, one entry per interface address. Peers come
//! from CIDR blocks and from interfaces or load balancers picked by an
//! object selector.

use apinet_api::internal::{
    LoadBalancer, NetworkInterface, NetworkPolicy, NetworkPolicyRule, NetworkPolicyRuleSpec, ObjectIP, Rule,
    TargetNetworkInterface,
};
use apinet_api::{LocalObjectReference, NetworkPolicyPeer, ObjectSelector, PolicyType, PortRange};
use apinet_api::labels::APINET_FIELD_OWNER;
use apinet_client::{ClientError, ListSelector};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{Reconciler, controller_reference, is_deleting, name_of};
use crate::error::ControllerError;

const NETWORK_INTERFACE_KIND: &str = "NetworkInterface";
const LOAD_BALANCER_KIND: &str = "LoadBalancer";

fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

fn in_network(network_ref: &LocalObjectReference, other: &LocalObjectReference) -> bool {
    network_ref.name == other.name
}

/// Objects of one namespace a policy may refer to.
struct Candidates {
    nics: Vec<NetworkInterface>,
    load_balancers: Vec<LoadBalancer>,
}

impl Candidates {
    fn object_ips(&self, network_ref: &LocalObjectReference, selector: &ObjectSelector) -> Option<Vec<ObjectIP>> {
        let ips = match selector.kind.as_str() {
            NETWORK_INTERFACE_KIND => self
                .nics
                .iter()
                .filter(|nic| in_network(network_ref, &nic.spec.network_ref))
                .filter(|nic| selector.selector.matches(&labels_of(&nic.metadata)))
                .flat_map(|nic| nic.spec.ips.iter().copied())
                .map(ObjectIP::for_ip)
                .collect(),
            LOAD_BALANCER_KIND => self
                .load_balancers
                .iter()
                .filter(|lb| in_network(network_ref, &lb.spec.network_ref))
                .filter(|lb| selector.selector.matches(&labels_of(&lb.metadata)))
                .flat_map(|lb| lb.spec.ips.iter().filter_map(|ip| ip.ip))
                .map(ObjectIP::for_ip)
                .collect(),
            _ => return None,
        };
        Some(ips)
    }

    fn rule(&self, policy: &NetworkPolicy, peers: &[NetworkPolicyPeer], ports: &[PortRange]) -> Rule {
        let mut rule = Rule {
            network_policy_ports: ports.to_vec(),
            ..Default::default()
        };
        for peer in peers {
            if let Some(block) = &peer.ip_block {
                rule.cidr_blocks.push(block.clone());
            }
            if let Some(selector) = &peer.object_selector {
                match self.object_ips(&policy.spec.network_ref, selector) {
                    Some(ips) => rule.object_ips.extend(ips),
                    None => warn!(
                        policy = ?policy.metadata.name,
                        kind = %selector.kind,
                        "Ignoring object selector of unsupported kind"
                    ),
                }
            }
        }
        rule.object_ips.sort();
        rule.object_ips.dedup();
        rule
    }
}

/// Interfaces selected by the policy, one target per address.
fn targets(policy: &NetworkPolicy, nics: &[NetworkInterface]) -> Vec<TargetNetworkInterface> {
    let mut targets: Vec<TargetNetworkInterface> = nics
        .iter()
        .filter(|nic| !is_deleting(*nic))
        .filter(|nic| in_network(&policy.spec.network_ref, &nic.spec.network_ref))
        .filter(|nic| policy.spec.network_interface_selector.matches(&labels_of(&nic.metadata)))
        .flat_map(|nic| {
            let uid = nic.metadata.uid.clone().unwrap_or_default();
            let name = nic.metadata.name.clone().unwrap_or_default();
            nic.spec.ips.iter().map(move |ip| TargetNetworkInterface {
                uid: uid.clone(),
                name: name.clone(),
                ip: *ip,
            })
        })
        .collect();
    targets.sort();
    targets
}

fn resolve(policy: &NetworkPolicy, candidates: &Candidates) -> NetworkPolicyRuleSpec {
    let applies = |t: PolicyType| policy.spec.policy_types.contains(&t);
    let ingress_rules = if applies(PolicyType::Ingress) {
        policy
            .spec
            .ingress
            .iter()
            .map(|r| candidates.rule(policy, &r.from, &r.ports))
            .collect()
    } else {
        Vec::new()
    };
    let egress_rules = if applies(PolicyType::Egress) {
        policy
            .spec
            .egress
            .iter()
            .map(|r| candidates.rule(policy, &r.to, &r.ports))
            .collect()
    } else {
        Vec::new()
    };

    NetworkPolicyRuleSpec {
        network_ref: policy.spec.network_ref.clone(),
        priority: policy.spec.priority,
        targets: targets(policy, &candidates.nics),
        ingress_rules,
        egress_rules,
    }
}

impl Reconciler {
    /// Applies the rule object of a policy. Deletion is left to the owner
    /// reference.
    pub async fn reconcile_network_policy(&self, policy: &NetworkPolicy) -> Result<Action, ControllerError> {
        let name = name_of(policy)?;
        if is_deleting(policy) {
            return Ok(Action::await_change());
        }
        let namespace = policy.metadata.namespace.as_deref();

        let candidates = Candidates {
            nics: self.clients.network_interfaces.list(namespace, &ListSelector::new()).await?,
            load_balancers: self.clients.load_balancers.list(namespace, &ListSelector::new()).await?,
        };

        let rule = NetworkPolicyRule {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: policy.metadata.namespace.clone(),
                owner_references: Some(vec![controller_reference(policy)?]),
                ..Default::default()
            },
            spec: resolve(policy, &candidates),
        };
        let value = serde_json::to_value(&rule).map_err(ClientError::from)?;
        self.clients
            .network_policy_rules
            .apply(namespace, name, &value, APINET_FIELD_OWNER)
            .await?;
        debug!(
            policy = name,
            targets = rule.spec.targets.len(),
            ingress = rule.spec.ingress_rules.len(),
            egress = rule.spec.egress_rules.len(),
            "Applied network policy rule"
        );
        Ok(Action::await_change())
    }
}

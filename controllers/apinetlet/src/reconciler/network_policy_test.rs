//! Tests for network policy translation

use apinet_api::upstream::network_policy::{NetworkPolicy, NetworkPolicySpec};
use apinet_api::{
    IPBlock, LabelSelector, LocalObjectReference, NetworkPolicyIngressRule, NetworkPolicyPeer, PolicyType, PortRange,
    Protocol,
};
use apinet_client::{ResourceClient, has_finalizer};
use maplit::btreemap;

use super::network_policy::NETWORK_POLICY_FINALIZER;
use crate::test_utils::{APINET_NAMESPACE, NAMESPACE, TestEnv, fetch, meta, network, uid};

fn policy(name: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: meta(name),
        spec: NetworkPolicySpec {
            network_ref: LocalObjectReference::new("net"),
            network_interface_selector: LabelSelector::from_labels(btreemap! {
                "app".to_string() => "web".to_string(),
            }),
            priority: Some(10),
            policy_types: vec![PolicyType::Ingress],
            ingress: vec![NetworkPolicyIngressRule {
                from: vec![NetworkPolicyPeer {
                    object_selector: None,
                    ip_block: Some(IPBlock {
                        cidr: "192.0.2.0/24".to_string(),
                        except: Vec::new(),
                    }),
                }],
                ports: vec![PortRange {
                    protocol: Some(Protocol::Tcp),
                    port: Some(80),
                    end_port: None,
                }],
            }],
            egress: Vec::new(),
        },
    }
}

#[tokio::test]
async fn test_policy_waits_for_network() {
    let env = TestEnv::new();
    env.upstream.networks.add(network("net")).unwrap();
    let p = env.upstream.network_policies.add(policy("allow-web")).unwrap();

    env.reconciler.reconcile_network_policy(&p).await.unwrap();

    assert!(!has_finalizer(&fetch(&env.upstream.network_policies, &p), NETWORK_POLICY_FINALIZER));
    assert!(env.apinet.network_policies.is_empty());
}

#[tokio::test]
async fn test_policy_translated() {
    let env = TestEnv::new();
    let (_, internal_network) = env.add_ready_network("net", 100).await;
    let p = env.upstream.network_policies.add(policy("allow-web")).unwrap();

    env.reconciler.reconcile_network_policy(&p).await.unwrap();

    assert!(has_finalizer(&fetch(&env.upstream.network_policies, &p), NETWORK_POLICY_FINALIZER));
    let internal = env
        .apinet
        .network_policies
        .object(Some(APINET_NAMESPACE), &uid(&p))
        .unwrap();
    assert_eq!(Some(internal.spec.network_ref.name.clone()), internal_network.metadata.name);
    assert_eq!(internal.spec.network_interface_selector, p.spec.network_interface_selector);
    assert_eq!(internal.spec.priority, Some(10));
    assert_eq!(internal.spec.policy_types, vec![PolicyType::Ingress]);
    assert_eq!(internal.spec.ingress, p.spec.ingress);
    assert!(internal.spec.egress.is_empty());
}

#[tokio::test]
async fn test_policy_deletion_removes_internal_policy() {
    let env = TestEnv::new();
    env.add_ready_network("net", 100).await;
    let p = env.upstream.network_policies.add(policy("allow-web")).unwrap();
    env.reconciler.reconcile_network_policy(&p).await.unwrap();

    env.upstream
        .network_policies
        .delete(Some(NAMESPACE), "allow-web")
        .await
        .unwrap();
    let p = fetch(&env.upstream.network_policies, &p);
    env.reconciler.reconcile_network_policy(&p).await.unwrap();

    assert!(env.apinet.network_policies.is_empty());
    assert!(env.upstream.network_policies.is_empty());
}

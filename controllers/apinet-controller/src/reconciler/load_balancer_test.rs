//! Tests for load balancer public IPs and daemon sets

use apinet_api::IPFamily;
use apinet_api::internal::{LoadBalancer, PublicIPRequest};
use apinet_api::labels::{LOAD_BALANCER_NAME_LABEL, ip_address_name};
use apinet_client::{ResourceClient, has_finalizer};
use serde_json::json;

use super::load_balancer::LOAD_BALANCER_FINALIZER;
use crate::test_utils::{NAMESPACE, TestEnv, load_balancer};

async fn reconciled(env: &TestEnv, name: &str) -> LoadBalancer {
    let current = env.load_balancers.object(Some(NAMESPACE), name).unwrap();
    env.reconciler.reconcile_load_balancer(&current).await.unwrap();
    env.load_balancers.object(Some(NAMESPACE), name).unwrap()
}

#[tokio::test]
async fn test_public_ip_allocated_and_propagated() {
    let env = TestEnv::new();
    env.load_balancers
        .add(load_balancer("lb", "net", vec![PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)]))
        .unwrap();

    let lb = reconciled(&env, "lb").await;
    assert!(has_finalizer(&lb, LOAD_BALANCER_FINALIZER));
    let address = lb.spec.ips[0].ip.unwrap();
    assert!("10.0.0.0/24".parse::<ipnet::IpNet>().unwrap().contains(&address));

    let ips = env.ips.objects();
    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0].spec.ip, Some(address));
    assert!(ips[0].is_claimed_by(lb.metadata.uid.as_deref().unwrap()));
    let leaf = env.ip_addresses.object(None, &ip_address_name(&address)).unwrap();
    assert_eq!(leaf.spec.claim_ref.uid, ips[0].metadata.uid.clone().unwrap());

    let ds = env.daemon_sets.object(Some(NAMESPACE), "lb").unwrap();
    assert_eq!(ds.spec.template.spec.ips, vec![address]);
    assert_eq!(
        ds.spec.template.metadata.labels.get(LOAD_BALANCER_NAME_LABEL).map(String::as_str),
        Some("lb")
    );
    let lb_ref = ds.spec.template.spec.load_balancer_ref.unwrap();
    assert_eq!(lb_ref.uid, lb.metadata.uid.unwrap());
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let env = TestEnv::new();
    env.load_balancers
        .add(load_balancer("lb", "net", vec![PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)]))
        .unwrap();
    reconciled(&env, "lb").await;

    let writes = (
        env.load_balancers.writes(),
        env.ips.writes(),
        env.ip_addresses.writes(),
        env.daemon_sets.writes(),
    );
    reconciled(&env, "lb").await;
    assert_eq!(
        (
            env.load_balancers.writes(),
            env.ips.writes(),
            env.ip_addresses.writes(),
            env.daemon_sets.writes(),
        ),
        writes
    );
}

#[tokio::test]
async fn test_reallocation_leaves_exactly_one_address() {
    let env = TestEnv::new();
    env.load_balancers
        .add(load_balancer("lb", "net", vec![PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)]))
        .unwrap();
    let first = reconciled(&env, "lb").await.spec.ips[0].ip.unwrap();

    // Dropping the address asks for a fresh one.
    env.load_balancers
        .patch(
            Some(NAMESPACE),
            "lb",
            &json!({"spec": {"ips": [{"name": "ip-1", "ipFamily": "IPv4"}]}}),
        )
        .await
        .unwrap();
    let lb = reconciled(&env, "lb").await;
    let second = lb.spec.ips[0].ip.unwrap();

    assert_eq!(env.ips.len(), 1);
    assert_eq!(env.ip_addresses.len(), 1);
    assert_eq!(env.ips.objects()[0].spec.ip, Some(second));
    assert!(env.ip_addresses.object(None, &ip_address_name(&second)).is_some());
    assert_ne!(first, second);
    assert!(env.ip_addresses.object(None, &ip_address_name(&first)).is_none());
    let ds = env.daemon_sets.object(Some(NAMESPACE), "lb").unwrap();
    assert_eq!(ds.spec.template.spec.ips, vec![second]);
}

#[tokio::test]
async fn test_failed_write_back_releases_allocation() {
    let env = TestEnv::new();
    env.load_balancers
        .add(load_balancer("lb", "net", vec![PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)]))
        .unwrap();
    let with_finalizer = reconciled(&env, "lb").await;
    assert_eq!(env.ips.len(), 1);

    // A second request on a stale copy loses the write race.
    let mut stale = with_finalizer.clone();
    stale.spec.ips.push(PublicIPRequest::ephemeral("ip-2", IPFamily::IPv4));
    env.load_balancers
        .patch(Some(NAMESPACE), "lb", &json!({"metadata": {"labels": {"touched": "true"}}}))
        .await
        .unwrap();

    let err = env.reconciler.reconcile_load_balancer(&stale).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(env.ips.len(), 1);
    assert_eq!(env.ip_addresses.len(), 1);
}

#[tokio::test]
async fn test_deletion_releases_everything() {
    let env = TestEnv::new();
    env.load_balancers
        .add(load_balancer("lb", "net", vec![PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)]))
        .unwrap();
    reconciled(&env, "lb").await;

    env.load_balancers.delete(Some(NAMESPACE), "lb").await.unwrap();
    let deleting = env.load_balancers.object(Some(NAMESPACE), "lb").unwrap();
    env.reconciler.reconcile_load_balancer(&deleting).await.unwrap();

    assert!(env.load_balancers.is_empty());
    assert!(env.ips.is_empty());
    assert!(env.ip_addresses.is_empty());
    assert!(env.daemon_sets.is_empty());
}

#[tokio::test]
async fn test_internal_load_balancer_keeps_given_addresses() {
    let env = TestEnv::new();
    let mut lb = load_balancer(
        "internal",
        "net",
        vec![PublicIPRequest {
            ip: Some("192.168.0.10".parse().unwrap()),
            ..PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)
        }],
    );
    lb.spec.type_ = apinet_api::LoadBalancerType::Internal;
    env.load_balancers.add(lb).unwrap();

    reconciled(&env, "internal").await;
    assert!(env.ips.is_empty());
    assert!(env.ip_addresses.is_empty());
    let ds = env.daemon_sets.object(Some(NAMESPACE), "internal").unwrap();
    assert_eq!(ds.spec.template.spec.ips, vec!["192.168.0.10".parse::<std::net::IpAddr>().unwrap()]);
}

//! Two-phase allocation through the Allocators facade

use apinet_allocator::{AllocationError, Allocators, IPAddressAllocator, IPAllocator, RetryConfig};
use apinet_api::internal::{
    IP, IPAddress, IPSpec, InstanceTemplate, LoadBalancer, LoadBalancerSpec, PublicIPRequest,
};
use apinet_api::labels::ip_address_name;
use apinet_api::{IPFamily, LoadBalancerType, LocalObjectReference};
use apinet_client::{MockClient, ResourceClient};
use ipnet::IpNet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Fixture {
    allocators: Allocators,
    ips: MockClient<IP>,
    addresses: MockClient<IPAddress>,
    lbs: MockClient<LoadBalancer>,
}

fn fixture(prefix: &str) -> Fixture {
    let ips = MockClient::<IP>::new();
    let addresses = MockClient::<IPAddress>::new();
    let prefix: IpNet = prefix.parse().unwrap();
    let allocators = Allocators::new(
        IPAllocator::new(
            Arc::new(ips.clone()),
            RetryConfig::with_max_attempts(3),
            CancellationToken::new(),
        ),
        IPAddressAllocator::new(Arc::new(addresses.clone()), vec![prefix]).unwrap(),
    );
    Fixture {
        allocators,
        ips,
        addresses,
        lbs: MockClient::new(),
    }
}

fn load_balancer(requests: Vec<PublicIPRequest>) -> LoadBalancer {
    let mut lb = LoadBalancer::new(
        "lb",
        LoadBalancerSpec {
            type_: LoadBalancerType::Public,
            network_ref: LocalObjectReference::new("n1"),
            ips: requests,
            ports: Vec::new(),
            selector: None,
            template: InstanceTemplate::default(),
        },
    );
    lb.metadata.namespace = Some("t".to_string());
    lb
}

#[tokio::test]
async fn test_allocate_create_and_fresh_update() {
    let f = fixture("10.0.0.0/24");
    let lb = f
        .lbs
        .add(load_balancer(vec![PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)]))
        .unwrap();

    let (resolved, tx) = f.allocators.allocate_create(&lb).await.unwrap();
    tx.commit().await.unwrap();
    let first = resolved[0].ip.unwrap();
    assert!("10.0.0.0/24".parse::<IpNet>().unwrap().contains(&first));
    assert_eq!(f.addresses.len(), 1);
    let leaf = f.addresses.object(None, &ip_address_name(&first)).unwrap();
    let holder = f.ips.objects().pop().unwrap();
    assert_eq!(Some(leaf.spec.claim_ref.uid), holder.metadata.uid);

    // Spec carries the address: nothing to do.
    let mut current = lb.clone();
    current.spec.ips = resolved;
    let (same, tx) = f.allocators.allocate_update(&current).await.unwrap();
    assert!(tx.allocated().is_empty());
    assert!(tx.superseded().is_empty());
    tx.commit().await.unwrap();
    assert_eq!(same[0].ip, Some(first));

    // Asking for a fresh ip-1 swaps the address.
    current.spec.ips[0].ip = None;
    let (fresh, tx) = f.allocators.allocate_update(&current).await.unwrap();
    let second = fresh[0].ip.unwrap();
    assert_ne!(first, second);
    assert_eq!(tx.superseded().len(), 1);
    tx.commit().await.unwrap();

    assert_eq!(f.addresses.len(), 1);
    assert!(f.addresses.object(None, &ip_address_name(&second)).is_some());
    assert_eq!(f.ips.len(), 1);
}

#[tokio::test]
async fn test_revert_releases_new_allocations() {
    let f = fixture("10.0.0.0/24");
    let lb = f
        .lbs
        .add(load_balancer(vec![
            PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4),
            PublicIPRequest::ephemeral("ip-2", IPFamily::IPv4),
        ]))
        .unwrap();

    let (_, tx) = f.allocators.allocate_create(&lb).await.unwrap();
    assert_eq!(tx.allocated().len(), 2);
    tx.revert().await.unwrap();

    assert!(f.ips.is_empty());
    assert!(f.addresses.is_empty());
}

#[tokio::test]
async fn test_partial_failure_rolls_back() {
    let f = fixture("10.0.0.0/31");
    let lb = f
        .lbs
        .add(load_balancer(vec![
            PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4),
            PublicIPRequest::ephemeral("ip-2", IPFamily::IPv4),
            PublicIPRequest::ephemeral("ip-3", IPFamily::IPv4),
        ]))
        .unwrap();

    let err = f.allocators.allocate_create(&lb).await.unwrap_err();
    assert!(matches!(err, AllocationError::PoolExhausted(_)));
    assert!(f.ips.is_empty());
    assert!(f.addresses.is_empty());
}

#[tokio::test]
async fn test_ip_ref_reserves_standalone_ip() {
    let f = fixture("10.0.0.0/24");
    let mut standalone = IP::new(
        "static",
        IPSpec {
            ip: Some("10.0.0.50".parse().unwrap()),
            ..Default::default()
        },
    );
    standalone.metadata.namespace = Some("t".to_string());
    f.ips.add(standalone).unwrap();

    let request = PublicIPRequest {
        ip_ref: Some(LocalObjectReference::new("static")),
        ..PublicIPRequest::ephemeral("ip-1", IPFamily::IPv4)
    };
    let lb = f.lbs.add(load_balancer(vec![request])).unwrap();

    let (resolved, tx) = f.allocators.allocate_create(&lb).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(resolved[0].ip, Some("10.0.0.50".parse().unwrap()));

    f.allocators.release(&lb).await.unwrap();
    let released = f.ips.get(Some("t"), "static").await.unwrap();
    assert_eq!(released.spec.claim_ref, None);
}

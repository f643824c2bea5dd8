//! Tests for NAT gateways, port blocks and the autoscaler

use apinet_api::IPFamily;
use apinet_api::LocalObjectReference;
use apinet_api::internal::{
    NATGateway, NATGatewayAutoscaler, NATGatewayAutoscalerSpec, NATGatewayIP, NATIPSection, PublicIPRequest,
};
use apinet_client::{ResourceClient, has_finalizer};
use kube::runtime::controller::Action;
use serde_json::json;
use std::net::IpAddr;

use super::nat_gateway::NAT_GATEWAY_FINALIZER;
use super::nat_gateway_autoscaler::{AUTOSCALER_RESYNC, desired_public_ips};
use crate::events::reasons;
use crate::test_utils::{NAMESPACE, TestEnv, meta, nat_gateway, network_interface};

fn gateway_with_ip(name: &str, ports: i32) -> NATGateway {
    let mut gateway = nat_gateway(name, "net", IPFamily::IPv4, ports);
    gateway.spec.ips = vec![NATGatewayIP {
        name: "ip-1".to_string(),
        ip: None,
    }];
    gateway
}

async fn reconciled(env: &TestEnv, name: &str) -> NATGateway {
    let current = env.nat_gateways.object(Some(NAMESPACE), name).unwrap();
    env.reconciler.reconcile_nat_gateway(&current).await.unwrap();
    env.nat_gateways.object(Some(NAMESPACE), name).unwrap()
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_first_interface_gets_first_port_block() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 64)).unwrap();
    env.network_interfaces
        .add(network_interface("nic-1", "net", "node-1", &["192.168.0.1"]))
        .unwrap();

    let gateway = reconciled(&env, "gw").await;
    assert!(has_finalizer(&gateway, NAT_GATEWAY_FINALIZER));
    let public = gateway.spec.ips[0].ip.unwrap();

    let table = env.nat_tables.object(Some(NAMESPACE), "gw").unwrap();
    assert_eq!(table.spec.ips.len(), 1);
    assert_eq!(table.spec.ips[0].ip, public);
    let section: &NATIPSection = &table.spec.ips[0].sections[0];
    assert_eq!((section.ip, section.port, section.end_port), (addr("192.168.0.1"), 1024, 1087));
    assert_eq!(section.target_ref.as_ref().unwrap().node_ref.name, "node-1");

    let nic = env.network_interfaces.object(Some(NAMESPACE), "nic-1").unwrap();
    let nat = nic.nat(IPFamily::IPv4).unwrap();
    assert_eq!(nat.claim_ref.uid, gateway.metadata.uid.clone().unwrap());

    let status = gateway.status.unwrap();
    assert_eq!((status.used_nat_ips, status.requested_nat_ips), (1, 1));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 64)).unwrap();
    env.network_interfaces
        .add(network_interface("nic-1", "net", "node-1", &["192.168.0.1"]))
        .unwrap();
    env.network_interfaces
        .add(network_interface("nic-2", "net", "node-2", &["192.168.0.2"]))
        .unwrap();
    reconciled(&env, "gw").await;

    let writes = (
        env.nat_gateways.writes(),
        env.nat_tables.writes(),
        env.network_interfaces.writes(),
        env.ips.writes(),
    );
    reconciled(&env, "gw").await;
    assert_eq!(
        (
            env.nat_gateways.writes(),
            env.nat_tables.writes(),
            env.network_interfaces.writes(),
            env.ips.writes(),
        ),
        writes
    );

    let table = env.nat_tables.object(Some(NAMESPACE), "gw").unwrap();
    let ports: Vec<_> = table.spec.ips[0].sections.iter().map(|s| (s.port, s.end_port)).collect();
    assert_eq!(ports, vec![(1024, 1087), (1088, 1151)]);
}

#[tokio::test]
async fn test_interfaces_with_public_ip_or_other_network_are_skipped() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 64)).unwrap();
    let mut public = network_interface("public", "net", "node-1", &["192.168.0.1"]);
    public.spec.public_ips = vec![PublicIPRequest::ephemeral("pub", IPFamily::IPv4)];
    env.network_interfaces.add(public).unwrap();
    env.network_interfaces
        .add(network_interface("elsewhere", "other", "node-1", &["192.168.0.2"]))
        .unwrap();
    env.network_interfaces
        .add(network_interface("v6-only", "net", "node-1", &["fd00::1"]))
        .unwrap();

    let gateway = reconciled(&env, "gw").await;
    let table = env.nat_tables.object(Some(NAMESPACE), "gw").unwrap();
    assert!(table.spec.ips[0].sections.is_empty());
    assert!(env.network_interfaces.objects().iter().all(|nic| nic.spec.nats.is_empty()));
    let status = gateway.status.unwrap_or_default();
    assert_eq!((status.used_nat_ips, status.requested_nat_ips), (0, 0));
}

#[tokio::test]
async fn test_interface_gaining_public_ip_is_released() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 64)).unwrap();
    env.network_interfaces
        .add(network_interface("nic-1", "net", "node-1", &["192.168.0.1"]))
        .unwrap();
    reconciled(&env, "gw").await;

    env.network_interfaces
        .patch(
            Some(NAMESPACE),
            "nic-1",
            &json!({"spec": {"publicIps": [{"name": "pub", "ipFamily": "IPv4"}]}}),
        )
        .await
        .unwrap();
    reconciled(&env, "gw").await;

    let nic = env.network_interfaces.object(Some(NAMESPACE), "nic-1").unwrap();
    assert!(nic.spec.nats.is_empty());
    let table = env.nat_tables.object(Some(NAMESPACE), "gw").unwrap();
    assert!(table.spec.ips[0].sections.is_empty());
}

#[tokio::test]
async fn test_exhausted_gateway_serves_in_name_order() {
    let env = TestEnv::new();
    // 32768 ports leave a single block per IP.
    env.nat_gateways.add(gateway_with_ip("gw", 32768)).unwrap();
    env.network_interfaces
        .add(network_interface("nic-b", "net", "node-1", &["192.168.0.2"]))
        .unwrap();
    env.network_interfaces
        .add(network_interface("nic-a", "net", "node-1", &["192.168.0.1"]))
        .unwrap();

    let gateway = reconciled(&env, "gw").await;
    let status = gateway.status.unwrap();
    assert_eq!((status.used_nat_ips, status.requested_nat_ips), (1, 2));
    let served = env.network_interfaces.object(Some(NAMESPACE), "nic-a").unwrap();
    assert!(served.nat(IPFamily::IPv4).is_some());
    let waiting = env.network_interfaces.object(Some(NAMESPACE), "nic-b").unwrap();
    assert!(waiting.nat(IPFamily::IPv4).is_none());
}

#[tokio::test]
async fn test_deletion_cleans_up() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 64)).unwrap();
    env.network_interfaces
        .add(network_interface("nic-1", "net", "node-1", &["192.168.0.1"]))
        .unwrap();
    reconciled(&env, "gw").await;

    env.nat_gateways.delete(Some(NAMESPACE), "gw").await.unwrap();
    let deleting = env.nat_gateways.object(Some(NAMESPACE), "gw").unwrap();
    env.reconciler.reconcile_nat_gateway(&deleting).await.unwrap();

    assert!(env.nat_gateways.is_empty());
    assert!(env.nat_tables.is_empty());
    assert!(env.ips.is_empty());
    assert!(env.ip_addresses.is_empty());
    let nic = env.network_interfaces.object(Some(NAMESPACE), "nic-1").unwrap();
    assert!(nic.spec.nats.is_empty());
}

#[tokio::test]
async fn test_invalid_ports_are_reported() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 100)).unwrap();

    let gateway = reconciled(&env, "gw").await;
    assert!(!has_finalizer(&gateway, NAT_GATEWAY_FINALIZER));
    assert!(env.ips.is_empty());
    assert_eq!(env.events.reasons_for("gw"), vec![reasons::INVALID_SPEC.to_string()]);
}

#[tokio::test]
async fn test_stale_nat_claim_is_released() {
    let env = TestEnv::new();
    env.nat_gateways.add(gateway_with_ip("gw", 64)).unwrap();
    env.network_interfaces
        .add(network_interface("nic-1", "net", "node-1", &["192.168.0.1"]))
        .unwrap();
    reconciled(&env, "gw").await;

    // The gateway vanishes without its finalizer running.
    env.nat_gateways
        .patch(Some(NAMESPACE), "gw", &json!({"metadata": {"finalizers": null}}))
        .await
        .unwrap();
    env.nat_gateways.delete(Some(NAMESPACE), "gw").await.unwrap();
    assert!(env.nat_gateways.is_empty());

    let nic = env.network_interfaces.object(Some(NAMESPACE), "nic-1").unwrap();
    env.reconciler.reconcile_network_interface_nat_release(&nic).await.unwrap();
    let nic = env.network_interfaces.object(Some(NAMESPACE), "nic-1").unwrap();
    assert!(nic.spec.nats.is_empty());

    let writes = env.network_interfaces.writes();
    env.reconciler.reconcile_network_interface_nat_release(&nic).await.unwrap();
    assert_eq!(env.network_interfaces.writes(), writes);
}

#[test]
fn test_desired_public_ips() {
    assert_eq!(desired_public_ips(0, 1008, None, None), 0);
    assert_eq!(desired_public_ips(1, 1008, None, None), 1);
    assert_eq!(desired_public_ips(1008, 1008, None, None), 1);
    assert_eq!(desired_public_ips(1009, 1008, None, None), 2);
    assert_eq!(desired_public_ips(0, 1008, Some(2), None), 2);
    assert_eq!(desired_public_ips(5000, 1008, None, Some(3)), 3);
    assert_eq!(desired_public_ips(0, 1008, Some(4), Some(2)), 2);
    assert_eq!(desired_public_ips(10, 0, None, None), 0);
}

fn autoscaler(name: &str, gateway: &str, min: Option<i32>, max: Option<i32>) -> NATGatewayAutoscaler {
    NATGatewayAutoscaler {
        metadata: meta(name),
        spec: NATGatewayAutoscalerSpec {
            nat_gateway_ref: LocalObjectReference::new(gateway),
            min_public_ips: min,
            max_public_ips: max,
        },
    }
}

#[tokio::test]
async fn test_autoscaler_grows_with_demand() {
    let env = TestEnv::new();
    env.nat_gateways.add(nat_gateway("gw", "net", IPFamily::IPv4, 64)).unwrap();
    env.nat_gateways
        .patch_status(Some(NAMESPACE), "gw", &json!({"status": {"requestedNatIps": 1500}}))
        .await
        .unwrap();
    let scaler = env.nat_gateway_autoscalers.add(autoscaler("scaler", "gw", None, Some(8))).unwrap();

    let action = env.reconciler.reconcile_nat_gateway_autoscaler(&scaler).await.unwrap();
    assert_eq!(action, Action::requeue(AUTOSCALER_RESYNC));

    let gateway = env.nat_gateways.object(Some(NAMESPACE), "gw").unwrap();
    assert_eq!(gateway.spec.ips.len(), 2);
    assert!(gateway.spec.ips.iter().all(|ip| ip.ip.is_none()));
    assert_ne!(gateway.spec.ips[0].name, gateway.spec.ips[1].name);

    let writes = env.nat_gateways.writes();
    env.reconciler.reconcile_nat_gateway_autoscaler(&scaler).await.unwrap();
    assert_eq!(env.nat_gateways.writes(), writes);
}

#[tokio::test]
async fn test_autoscaler_shrinks_to_minimum() {
    let env = TestEnv::new();
    let mut gateway = nat_gateway("gw", "net", IPFamily::IPv4, 64);
    gateway.spec.ips = ["a", "b", "c"]
        .iter()
        .map(|name| NATGatewayIP {
            name: name.to_string(),
            ip: None,
        })
        .collect();
    env.nat_gateways.add(gateway).unwrap();
    let scaler = env.nat_gateway_autoscalers.add(autoscaler("scaler", "gw", Some(1), None)).unwrap();

    env.reconciler.reconcile_nat_gateway_autoscaler(&scaler).await.unwrap();
    let gateway = env.nat_gateways.object(Some(NAMESPACE), "gw").unwrap();
    let names: Vec<_> = gateway.spec.ips.iter().map(|ip| ip.name.as_str()).collect();
    assert_eq!(names, vec!["a"]);
}

#[tokio::test]
async fn test_autoscaler_without_gateway_waits() {
    let env = TestEnv::new();
    let scaler = env.nat_gateway_autoscalers.add(autoscaler("scaler", "missing", Some(1), None)).unwrap();

    let action = env.reconciler.reconcile_nat_gateway_autoscaler(&scaler).await.unwrap();
    assert_eq!(action, Action::requeue(AUTOSCALER_RESYNC));
    assert!(env.nat_gateways.is_empty());
}

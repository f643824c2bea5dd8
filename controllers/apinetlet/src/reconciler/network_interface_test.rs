//! Tests for network interface translation

use apinet_api::internal as apinet;
use apinet_api::labels::SOURCE_UID_LABEL;
use apinet_api::provider_id::make_network_interface_id;
use apinet_api::upstream::network_interface::{
    EphemeralVirtualIPSource, NATIPStatus, NetworkInterface, NetworkInterfaceSpec, NetworkInterfaceState,
    PrefixSource, VirtualIPSource,
};
use apinet_api::upstream::prefix::{Prefix, PrefixPhase, PrefixSpec, PrefixStatus};
use apinet_api::upstream::virtual_ip::{VirtualIP, VirtualIPSpec, VirtualIPType};
use apinet_api::{IPFamily, LocalObjectReference};
use apinet_client::{ResourceClient, has_finalizer};
use kube::runtime::controller::Action;
use maplit::btreemap;
use serde_json::json;

use super::network_interface::{NETWORK_INTERFACE_FINALIZER, PENDING_REQUEUE, VIRTUAL_IP_REQUEST};
use crate::test_utils::{APINET_NAMESPACE, NAMESPACE, TestEnv, apinet_meta, fetch, meta, uid};

fn internal_nic(name: &str) -> apinet::NetworkInterface {
    apinet::NetworkInterface {
        metadata: apinet_meta(name),
        spec: apinet::NetworkInterfaceSpec {
            network_ref: LocalObjectReference::new("net-internal"),
            node_ref: LocalObjectReference::new("node-1"),
            ips: vec!["10.0.0.5".parse().unwrap()],
            ..Default::default()
        },
        status: None,
    }
}

fn nic(name: &str, provider_id: Option<String>) -> NetworkInterface {
    NetworkInterface {
        metadata: meta(name),
        spec: NetworkInterfaceSpec {
            provider_id,
            network_ref: LocalObjectReference::new("net"),
            ips: vec!["10.0.0.5".parse().unwrap()],
            virtual_ip: None,
            prefixes: Vec::new(),
        },
        status: None,
    }
}

fn provider_id_of(internal: &apinet::NetworkInterface) -> Option<String> {
    Some(make_network_interface_id(
        APINET_NAMESPACE,
        internal.metadata.name.as_deref().unwrap(),
        "node-1",
        &uid(internal),
    ))
}

fn state_of(nic: &NetworkInterface) -> Option<NetworkInterfaceState> {
    nic.status.as_ref().and_then(|s| s.state)
}

#[tokio::test]
async fn test_pending_without_provider_id() {
    let env = TestEnv::new();
    let upstream = env.upstream.network_interfaces.add(nic("nic", None)).unwrap();

    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    assert!(!has_finalizer(&upstream, NETWORK_INTERFACE_FINALIZER));
    assert_eq!(state_of(&upstream), Some(NetworkInterfaceState::Pending));
}

#[tokio::test]
async fn test_malformed_provider_id_is_error() {
    let env = TestEnv::new();
    let upstream = env
        .upstream
        .network_interfaces
        .add(nic("nic", Some("bogus".to_string())))
        .unwrap();

    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    assert!(has_finalizer(&upstream, NETWORK_INTERFACE_FINALIZER));
    assert_eq!(state_of(&upstream), Some(NetworkInterfaceState::Error));
}

#[tokio::test]
async fn test_pending_while_internal_interface_missing() {
    let env = TestEnv::new();
    let provider_id = make_network_interface_id(APINET_NAMESPACE, "nic-internal", "node-1", "gone");
    let upstream = env
        .upstream
        .network_interfaces
        .add(nic("nic", Some(provider_id)))
        .unwrap();

    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    assert_eq!(state_of(&upstream), Some(NetworkInterfaceState::Pending));
}

#[tokio::test]
async fn test_internal_interface_claimed_and_configured() {
    let env = TestEnv::new();
    let internal = env.apinet.network_interfaces.add(internal_nic("nic-internal")).unwrap();
    let upstream = env
        .upstream
        .network_interfaces
        .add(NetworkInterface {
            spec: NetworkInterfaceSpec {
                virtual_ip: Some(VirtualIPSource {
                    virtual_ip_ref: None,
                    ephemeral: Some(EphemeralVirtualIPSource {
                        ip_family: IPFamily::IPv4,
                    }),
                }),
                prefixes: vec![PrefixSource {
                    value: Some("10.1.0.0/24".to_string()),
                    prefix_ref: None,
                }],
                ..nic("nic", provider_id_of(&internal)).spec
            },
            ..nic("nic", None)
        })
        .unwrap();

    let action = env.reconciler.reconcile_network_interface(&upstream).await.unwrap();
    assert_eq!(action, Action::await_change());

    let internal = fetch(&env.apinet.network_interfaces, &internal);
    assert_eq!(
        internal.metadata.labels.as_ref().unwrap().get(SOURCE_UID_LABEL),
        Some(&uid(&upstream))
    );
    assert_eq!(
        internal.spec.public_ips,
        vec![apinet::PublicIPRequest::ephemeral(VIRTUAL_IP_REQUEST, IPFamily::IPv4)]
    );
    assert_eq!(internal.spec.prefixes, vec!["10.1.0.0/24".to_string()]);

    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    let status = upstream.status.clone().unwrap();
    assert_eq!(status.state, Some(NetworkInterfaceState::Pending));
    assert_eq!(status.ips, vec!["10.0.0.5".parse::<std::net::IpAddr>().unwrap()]);
    assert_eq!(status.virtual_ip, None);

    // The internal store allocates the public IP and readies the interface.
    env.apinet
        .network_interfaces
        .patch(
            Some(APINET_NAMESPACE),
            "nic-internal",
            &json!({ "spec": { "publicIps": [
                { "name": VIRTUAL_IP_REQUEST, "ipFamily": "IPv4", "ip": "203.0.113.5" },
            ] } }),
        )
        .await
        .unwrap();
    env.apinet
        .network_interfaces
        .patch_status(
            Some(APINET_NAMESPACE),
            "nic-internal",
            &json!({ "status": { "state": "Ready" } }),
        )
        .await
        .unwrap();
    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let status = fetch(&env.upstream.network_interfaces, &upstream).status.unwrap();
    assert_eq!(status.state, Some(NetworkInterfaceState::Available));
    assert_eq!(status.virtual_ip, Some("203.0.113.5".parse().unwrap()));
    assert_eq!(status.prefixes, vec!["10.1.0.0/24".to_string()]);
    let internal = fetch(&env.apinet.network_interfaces, &internal);
    assert_eq!(internal.spec.public_ips[0].ip, Some("203.0.113.5".parse().unwrap()));
}

#[tokio::test]
async fn test_interface_claimed_by_another_record_is_error() {
    let env = TestEnv::new();
    let internal = env
        .apinet
        .network_interfaces
        .add(apinet::NetworkInterface {
            metadata: kube::api::ObjectMeta {
                labels: Some(btreemap! {
                    SOURCE_UID_LABEL.to_string() => "someone-else".to_string(),
                }),
                ..apinet_meta("nic-internal")
            },
            ..internal_nic("nic-internal")
        })
        .unwrap();
    let upstream = env
        .upstream
        .network_interfaces
        .add(nic("nic", provider_id_of(&internal)))
        .unwrap();

    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    assert_eq!(state_of(&upstream), Some(NetworkInterfaceState::Error));
    let internal = fetch(&env.apinet.network_interfaces, &internal);
    assert_eq!(
        internal.metadata.labels.unwrap().get(SOURCE_UID_LABEL),
        Some(&"someone-else".to_string())
    );
}

#[tokio::test]
async fn test_virtual_ip_reference_resolved_to_uid() {
    let env = TestEnv::new();
    let internal = env.apinet.network_interfaces.add(internal_nic("nic-internal")).unwrap();
    let spec = NetworkInterfaceSpec {
        virtual_ip: Some(VirtualIPSource {
            virtual_ip_ref: Some(LocalObjectReference::new("vip")),
            ephemeral: None,
        }),
        ..nic("nic", provider_id_of(&internal)).spec
    };
    let upstream = env
        .upstream
        .network_interfaces
        .add(NetworkInterface {
            spec,
            ..nic("nic", None)
        })
        .unwrap();

    let action = env.reconciler.reconcile_network_interface(&upstream).await.unwrap();
    assert_eq!(action, Action::requeue(PENDING_REQUEUE));
    assert!(fetch(&env.apinet.network_interfaces, &internal).spec.public_ips.is_empty());

    let vip = env
        .upstream
        .virtual_ips
        .add(VirtualIP {
            metadata: meta("vip"),
            spec: VirtualIPSpec {
                type_: VirtualIPType::Public,
                ip_family: IPFamily::IPv4,
                target_ref: None,
            },
            status: None,
        })
        .unwrap();
    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    let action = env.reconciler.reconcile_network_interface(&upstream).await.unwrap();
    assert_eq!(action, Action::await_change());

    let internal = fetch(&env.apinet.network_interfaces, &internal);
    assert_eq!(internal.spec.public_ips.len(), 1);
    assert_eq!(internal.spec.public_ips[0].name, VIRTUAL_IP_REQUEST);
    assert_eq!(internal.spec.public_ips[0].ip_ref, Some(LocalObjectReference::new(uid(&vip))));
}

#[tokio::test]
async fn test_prefix_reference_waits_for_allocation() {
    let env = TestEnv::new();
    let internal = env.apinet.network_interfaces.add(internal_nic("nic-internal")).unwrap();
    let prefix = env
        .upstream
        .prefixes
        .add(Prefix {
            metadata: meta("pfx"),
            spec: PrefixSpec {
                ip_family: IPFamily::IPv4,
                prefix: Some("10.2.0.0/24".to_string()),
            },
            status: Some(PrefixStatus {
                phase: Some(PrefixPhase::Pending),
            }),
        })
        .unwrap();
    let spec = NetworkInterfaceSpec {
        prefixes: vec![PrefixSource {
            value: None,
            prefix_ref: Some(LocalObjectReference::new("pfx")),
        }],
        ..nic("nic", provider_id_of(&internal)).spec
    };
    let upstream = env
        .upstream
        .network_interfaces
        .add(NetworkInterface {
            spec,
            ..nic("nic", None)
        })
        .unwrap();

    let action = env.reconciler.reconcile_network_interface(&upstream).await.unwrap();
    assert_eq!(action, Action::requeue(PENDING_REQUEUE));
    assert!(fetch(&env.apinet.network_interfaces, &internal).spec.prefixes.is_empty());

    env.upstream
        .prefixes
        .patch_status(Some(NAMESPACE), "pfx", &json!({ "status": { "phase": "Allocated" } }))
        .await
        .unwrap();
    assert!(fetch(&env.upstream.prefixes, &prefix).allocated_prefix().is_some());
    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let internal = fetch(&env.apinet.network_interfaces, &internal);
    assert_eq!(internal.spec.prefixes, vec!["10.2.0.0/24".to_string()]);
}

#[tokio::test]
async fn test_nat_port_blocks_reported() {
    let env = TestEnv::new();
    let internal = env.apinet.network_interfaces.add(internal_nic("nic-internal")).unwrap();
    let target = |uid: &str| {
        Some(apinet::NATTableIPTargetRef {
            uid: uid.to_string(),
            name: "whatever".to_string(),
            node_ref: LocalObjectReference::new("node-1"),
        })
    };
    env.apinet
        .nat_tables
        .add(apinet::NATTable {
            metadata: apinet_meta("nat"),
            spec: apinet::NATTableSpec {
                ips: vec![apinet::NATIP {
                    ip: "203.0.113.9".parse().unwrap(),
                    sections: vec![
                        apinet::NATIPSection {
                            ip: "10.0.0.6".parse().unwrap(),
                            port: 1024,
                            end_port: 3071,
                            target_ref: target("other"),
                        },
                        apinet::NATIPSection {
                            ip: "10.0.0.5".parse().unwrap(),
                            port: 3072,
                            end_port: 5119,
                            target_ref: target(&uid(&internal)),
                        },
                    ],
                }],
            },
        })
        .unwrap();
    let upstream = env
        .upstream
        .network_interfaces
        .add(nic("nic", provider_id_of(&internal)))
        .unwrap();

    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    let status = fetch(&env.upstream.network_interfaces, &upstream).status.unwrap();
    assert_eq!(
        status.nat_ips,
        vec![NATIPStatus {
            ip: "203.0.113.9".parse().unwrap(),
            port: 3072,
            end_port: 5119,
        }]
    );
}

#[tokio::test]
async fn test_deletion_releases_internal_interface() {
    let env = TestEnv::new();
    let internal = env.apinet.network_interfaces.add(internal_nic("nic-internal")).unwrap();
    let spec = NetworkInterfaceSpec {
        virtual_ip: Some(VirtualIPSource {
            virtual_ip_ref: None,
            ephemeral: Some(EphemeralVirtualIPSource {
                ip_family: IPFamily::IPv4,
            }),
        }),
        ..nic("nic", provider_id_of(&internal)).spec
    };
    let upstream = env
        .upstream
        .network_interfaces
        .add(NetworkInterface {
            spec,
            ..nic("nic", None)
        })
        .unwrap();
    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();
    assert_eq!(fetch(&env.apinet.network_interfaces, &internal).spec.public_ips.len(), 1);

    env.upstream
        .network_interfaces
        .delete(Some(NAMESPACE), "nic")
        .await
        .unwrap();
    let upstream = fetch(&env.upstream.network_interfaces, &upstream);
    env.reconciler.reconcile_network_interface(&upstream).await.unwrap();

    assert!(env.upstream.network_interfaces.is_empty());
    let internal = fetch(&env.apinet.network_interfaces, &internal);
    assert!(internal.spec.public_ips.is_empty());
    assert!(
        internal
            .metadata
            .labels
            .unwrap_or_default()
            .get(SOURCE_UID_LABEL)
            .is_none()
    );
}

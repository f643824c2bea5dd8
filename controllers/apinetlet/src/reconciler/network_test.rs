//! Tests for network translation

use apinet_api::labels::SOURCE_UID_LABEL;
use apinet_api::provider_id::make_network_id;
use apinet_api::upstream::network::{
    Network, NetworkPeering, NetworkPeeringNetworkRef, NetworkPeeringState, NetworkSpec, NetworkState,
};
use apinet_client::{ResourceClient, has_finalizer};
use kube::runtime::controller::Action;
use serde_json::json;

use super::DELETION_REQUEUE;
use super::network::NETWORK_FINALIZER;
use crate::test_utils::{APINET_NAMESPACE, NAMESPACE, TestEnv, fetch, network, uid};

#[tokio::test]
async fn test_network_translated_without_vni() {
    let env = TestEnv::new();
    let net = env.upstream.networks.add(network("net")).unwrap();

    env.reconciler.reconcile_network(&net).await.unwrap();

    let net = fetch(&env.upstream.networks, &net);
    assert!(has_finalizer(&net, NETWORK_FINALIZER));
    assert_eq!(net.spec.provider_id, None);
    assert_eq!(net.status.as_ref().unwrap().state, Some(NetworkState::Pending));

    let internal = env.apinet.networks.object(Some(APINET_NAMESPACE), &uid(&net)).unwrap();
    assert_eq!(
        internal.metadata.labels.unwrap().get(SOURCE_UID_LABEL),
        Some(&uid(&net))
    );
    assert_eq!(internal.spec.id, None);
}

#[tokio::test]
async fn test_network_publishes_provider_id() {
    let env = TestEnv::new();
    let net = env.upstream.networks.add(network("net")).unwrap();
    env.reconciler.reconcile_network(&net).await.unwrap();

    // The internal store allocates the VNI.
    let internal = env
        .apinet
        .networks
        .patch(Some(APINET_NAMESPACE), &uid(&net), &json!({ "spec": { "id": "4711" } }))
        .await
        .unwrap();

    let net = fetch(&env.upstream.networks, &net);
    env.reconciler.reconcile_network(&net).await.unwrap();

    let net = fetch(&env.upstream.networks, &net);
    assert_eq!(
        net.spec.provider_id,
        Some(make_network_id(APINET_NAMESPACE, &uid(&net), 4711, &uid(&internal)))
    );
    assert_eq!(net.status.as_ref().unwrap().state, Some(NetworkState::Available));

    // The allocated VNI survives the next apply.
    env.reconciler.reconcile_network(&net).await.unwrap();
    let internal = fetch(&env.apinet.networks, &internal);
    assert_eq!(internal.spec.id.as_deref(), Some("4711"));
}

#[tokio::test]
async fn test_network_peering_resolved_to_vni() {
    let env = TestEnv::new();
    env.add_ready_network("peer", 200).await;
    let net = env
        .upstream
        .networks
        .add(Network {
            spec: NetworkSpec {
                provider_id: None,
                peerings: vec![NetworkPeering {
                    name: "to-peer".to_string(),
                    network_ref: NetworkPeeringNetworkRef {
                        name: "peer".to_string(),
                        namespace: None,
                    },
                }],
            },
            ..network("net")
        })
        .unwrap();

    env.reconciler.reconcile_network(&net).await.unwrap();

    let internal = env.apinet.networks.object(Some(APINET_NAMESPACE), &uid(&net)).unwrap();
    assert_eq!(internal.spec.peerings.len(), 1);
    assert_eq!(internal.spec.peerings[0].name, "to-peer");
    assert_eq!(internal.spec.peerings[0].id, "200");

    let net = fetch(&env.upstream.networks, &net);
    let status = net.status.clone().unwrap();
    assert_eq!(status.peerings[0].state, NetworkPeeringState::Pending);

    env.apinet
        .networks
        .patch_status(
            Some(APINET_NAMESPACE),
            &uid(&net),
            &json!({ "status": { "peerings": [{ "id": "200", "state": "Ready" }] } }),
        )
        .await
        .unwrap();
    env.reconciler.reconcile_network(&net).await.unwrap();

    let status = fetch(&env.upstream.networks, &net).status.unwrap();
    assert_eq!(status.peerings[0].name, "to-peer");
    assert_eq!(status.peerings[0].state, NetworkPeeringState::Ready);
}

#[tokio::test]
async fn test_unresolved_peer_is_skipped() {
    let env = TestEnv::new();
    env.upstream.networks.add(network("peer")).unwrap();
    let net = env
        .upstream
        .networks
        .add(Network {
            spec: NetworkSpec {
                provider_id: None,
                peerings: vec![NetworkPeering {
                    name: "to-peer".to_string(),
                    network_ref: NetworkPeeringNetworkRef {
                        name: "peer".to_string(),
                        namespace: None,
                    },
                }],
            },
            ..network("net")
        })
        .unwrap();

    env.reconciler.reconcile_network(&net).await.unwrap();

    let internal = env.apinet.networks.object(Some(APINET_NAMESPACE), &uid(&net)).unwrap();
    assert!(internal.spec.peerings.is_empty());
    let status = fetch(&env.upstream.networks, &net).status.unwrap();
    assert_eq!(status.peerings[0].state, NetworkPeeringState::Pending);
}

#[tokio::test]
async fn test_network_deletion_removes_internal_network() {
    let env = TestEnv::new();
    let net = env.upstream.networks.add(network("net")).unwrap();
    env.reconciler.reconcile_network(&net).await.unwrap();
    assert_eq!(env.apinet.networks.len(), 1);

    env.upstream.networks.delete(Some(NAMESPACE), "net").await.unwrap();
    let net = fetch(&env.upstream.networks, &net);
    assert!(net.metadata.deletion_timestamp.is_some());

    env.reconciler.reconcile_network(&net).await.unwrap();
    assert!(env.apinet.networks.is_empty());
    assert!(env.upstream.networks.is_empty());
}

#[tokio::test]
async fn test_network_deletion_waits_for_internal_finalizers() {
    let env = TestEnv::new();
    let net = env.upstream.networks.add(network("net")).unwrap();
    env.reconciler.reconcile_network(&net).await.unwrap();
    env.apinet
        .networks
        .patch(
            Some(APINET_NAMESPACE),
            &uid(&net),
            &json!({ "metadata": { "finalizers": ["apinet.ironcore.dev/network"] } }),
        )
        .await
        .unwrap();

    env.upstream.networks.delete(Some(NAMESPACE), "net").await.unwrap();
    let net = fetch(&env.upstream.networks, &net);
    let action = env.reconciler.reconcile_network(&net).await.unwrap();

    assert_eq!(action, Action::requeue(DELETION_REQUEUE));
    assert!(has_finalizer(&fetch(&env.upstream.networks, &net), NETWORK_FINALIZER));
}

//! Networks: the internal network, its peerings and the provider ID.

use apinet_api::internal as apinet;
use apinet_api::labels::APINETLET_FIELD_OWNER;
use apinet_api::provider_id::make_network_id;
use apinet_api::upstream::network::{Network, NetworkPeeringState, NetworkPeeringStatus, NetworkState, NetworkStatus};
use apinet_api::vni::encode_vni;
use apinet_client::{add_finalizer, has_finalizer, remove_finalizer};
use kube::runtime::controller::Action;
use serde_json::json;
use tracing::{debug, info};

use super::{DELETION_REQUEUE, Reconciler, is_deleting, name_of, to_apply, uid_of, update_status};
use crate::error::ControllerError;

/// Held until the internal network is gone.
pub const NETWORK_FINALIZER: &str = "apinetlet.apinet.ironcore.dev/network";

/// Upstream peering states, looked up through the internal peering of the
/// same name.
fn peering_statuses(network: &Network, internal: &apinet::Network) -> Vec<NetworkPeeringStatus> {
    network
        .spec
        .peerings
        .iter()
        .map(|peering| {
            let ready = internal
                .spec
                .peerings
                .iter()
                .find(|p| p.name == peering.name)
                .and_then(|p| {
                    internal
                        .status
                        .as_ref()?
                        .peerings
                        .iter()
                        .find(|s| s.id == p.id)
                })
                .is_some_and(|s| s.state == apinet::NetworkPeeringState::Ready);
            NetworkPeeringStatus {
                name: peering.name.clone(),
                state: if ready {
                    NetworkPeeringState::Ready
                } else {
                    NetworkPeeringState::Pending
                },
            }
        })
        .collect()
}

impl Reconciler {
    /// Applies the internal network, then publishes its VNI as the
    /// upstream provider ID together with the peering states.
    pub async fn reconcile_network(&self, network: &Network) -> Result<Action, ControllerError> {
        let name = name_of(network)?;
        let namespace = network.metadata.namespace.as_deref();
        let client = self.upstream.networks.as_ref();
        let apinet_name = uid_of(network)?.to_string();

        if is_deleting(network) {
            if !has_finalizer(network, NETWORK_FINALIZER) {
                return Ok(Action::await_change());
            }
            if !self.delete_translated(self.apinet.networks.as_ref(), &apinet_name).await? {
                debug!(network = name, "Waiting for internal network to be deleted");
                return Ok(Action::requeue(DELETION_REQUEUE));
            }
            remove_finalizer(client, network, NETWORK_FINALIZER).await?;
            info!(network = name, "Released network");
            return Ok(Action::await_change());
        }

        let network = add_finalizer(client, network, NETWORK_FINALIZER).await?;

        let mut peerings = Vec::new();
        for peering in &network.spec.peerings {
            let peer_namespace = peering.network_ref.namespace.as_deref().or(namespace);
            match self.resolve_network(peer_namespace, &peering.network_ref.name).await? {
                Some(peer) => peerings.push(apinet::NetworkPeering {
                    name: peering.name.clone(),
                    id: encode_vni(peer.vni),
                }),
                None => debug!(network = name, peering = %peering.name, "Peer network has no VNI yet"),
            }
        }

        let existing = self.apinet.networks.get_opt(self.apinet_namespace(), &apinet_name).await?;
        let desired = apinet::Network {
            metadata: self.translated_meta(&network)?,
            spec: apinet::NetworkSpec {
                // The VNI is allocated in the internal store; keep it.
                id: existing.and_then(|n| n.spec.id),
                peerings,
            },
            status: None,
        };
        let internal = self
            .apinet
            .networks
            .apply(self.apinet_namespace(), &apinet_name, &to_apply(&desired)?, APINETLET_FIELD_OWNER)
            .await?;

        let Some(vni) = internal.vni() else {
            debug!(network = name, "Internal network has no VNI yet");
            let status = NetworkStatus {
                state: Some(NetworkState::Pending),
                peerings: peering_statuses(&network, &internal),
            };
            update_status(client, &network, network.status.as_ref(), status).await?;
            return Ok(Action::await_change());
        };

        let provider_id = make_network_id(&self.config.apinet_namespace, &apinet_name, vni, uid_of(&internal)?);
        let network = if network.spec.provider_id.as_deref() == Some(provider_id.as_str()) {
            network
        } else {
            let patch = json!({
                "metadata": { "resourceVersion": network.metadata.resource_version },
                "spec": { "providerId": provider_id },
            });
            let patched = client.patch(namespace, name, &patch).await?;
            info!(network = name, provider_id = %provider_id, "Published network provider ID");
            patched
        };

        let status = NetworkStatus {
            state: Some(NetworkState::Available),
            peerings: peering_statuses(&network, &internal),
        };
        update_status(client, &network, network.status.as_ref(), status).await?;
        Ok(Action::await_change())
    }
}

//! Network reconciliation: VNI allocation and peering status.

use apinet_allocator::AllocationError;
use apinet_api::internal::{Network, NetworkPeeringState, NetworkPeeringStatus, NetworkStatus};
use apinet_api::vni::{encode_vni, parse_vni};
use apinet_api::ClaimRef;
use apinet_client::ListSelector;
use kube::Resource;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{Reconciler, is_deleting, name_of, uid_of};
use crate::error::ControllerError;
use crate::events::{actions, reasons};

/// Claim reference a `NetworkID` leaf carries for `network`.
pub(crate) fn network_claim_ref(network: &Network) -> Result<ClaimRef, ControllerError> {
    Ok(ClaimRef {
        group: Network::group(&()).into_owned(),
        resource: Network::plural(&()).into_owned(),
        namespace: network.metadata.namespace.clone(),
        name: name_of(network)?.to_string(),
        uid: uid_of(network)?.to_string(),
    })
}

impl Reconciler {
    /// Makes sure the network holds a VNI and reports its peerings.
    ///
    /// A requested id is allocated as given; an empty id gets any free VNI
    /// which is then written back. Releasing happens through the
    /// `NetworkID` garbage collector once the network is gone.
    pub async fn reconcile_network(&self, network: &Network) -> Result<Action, ControllerError> {
        let name = name_of(network)?;
        if is_deleting(network) {
            debug!(network = name, "Network is being deleted");
            return Ok(Action::await_change());
        }

        let claim_ref = network_claim_ref(network)?;
        let network = match network.spec.id.as_deref() {
            Some(id) => {
                let vni = match parse_vni(id) {
                    Ok(vni) => vni,
                    Err(e) => {
                        warn!(network = name, id, error = %e, "Network has a malformed id");
                        self.publish(network, EventType::Warning, reasons::ALLOCATION_FAILED, actions::ALLOCATE, e.to_string())
                            .await;
                        return Ok(Action::await_change());
                    }
                };
                match self.vni_allocator.allocate(&claim_ref, vni).await {
                    Ok(_) => network.clone(),
                    Err(e @ (AllocationError::AlreadyAllocated(_) | AllocationError::OutOfRange(_))) => {
                        warn!(network = name, vni, error = %e, "Requested VNI is not available");
                        self.publish(network, EventType::Warning, reasons::ALLOCATION_FAILED, actions::ALLOCATE, e.to_string())
                            .await;
                        return Ok(Action::await_change());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => self.assign_vni(network, &claim_ref).await?,
        };

        self.update_peering_status(&network).await?;
        Ok(Action::await_change())
    }

    async fn assign_vni(&self, network: &Network, claim_ref: &ClaimRef) -> Result<Network, ControllerError> {
        let name = name_of(network)?;
        let vni = match self.vni_allocator.allocate_next(claim_ref).await {
            Ok(vni) => vni,
            Err(e @ AllocationError::PoolExhausted(_)) => {
                self.publish(network, EventType::Warning, reasons::ALLOCATION_FAILED, actions::ALLOCATE, e.to_string())
                    .await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let patch = json!({
            "metadata": { "resourceVersion": network.metadata.resource_version },
            "spec": { "id": encode_vni(vni) },
        });
        match self
            .clients
            .networks
            .patch(network.metadata.namespace.as_deref(), name, &patch)
            .await
        {
            Ok(updated) => {
                info!(network = name, vni, "Assigned VNI");
                Ok(updated)
            }
            Err(e) => {
                if let Err(release_err) = self.vni_allocator.release(vni).await {
                    warn!(network = name, vni, error = %release_err, "Failed to release VNI after failed write");
                }
                Err(e.into())
            }
        }
    }

    /// A peering is ready once the peer lists this network's id back.
    async fn update_peering_status(&self, network: &Network) -> Result<(), ControllerError> {
        let Some(own_id) = network.spec.id.as_deref() else {
            return Ok(());
        };

        let all = self.clients.networks.list(None, &ListSelector::new()).await?;
        let by_id: HashMap<&str, &Network> = all
            .iter()
            .filter(|n| !is_deleting(*n))
            .filter_map(|n| n.spec.id.as_deref().map(|id| (id, n)))
            .collect();

        let mut peerings = Vec::with_capacity(network.spec.peerings.len());
        let mut peered_ids = Vec::new();
        for peering in &network.spec.peerings {
            let mutual = by_id
                .get(peering.id.as_str())
                .is_some_and(|peer| peer.spec.peerings.iter().any(|p| p.id == own_id));
            let state = if mutual {
                peered_ids.push(peering.id.clone());
                NetworkPeeringState::Ready
            } else {
                NetworkPeeringState::Pending
            };
            peerings.push(NetworkPeeringStatus {
                id: peering.id.clone(),
                state,
            });
        }
        peered_ids.sort_by_key(|id| (parse_vni(id).unwrap_or(u32::MAX), id.clone()));
        peered_ids.dedup();

        let status = NetworkStatus { peerings, peered_ids };
        if network.status.clone().unwrap_or_default() == status {
            return Ok(());
        }
        self.clients
            .networks
            .patch_status(
                network.metadata.namespace.as_deref(),
                name_of(network)?,
                &json!({
                    "status": {
                        "peerings": status.peerings,
                        "peeredIds": status.peered_ids,
                    }
                }),
            )
            .await?;
        debug!(network = %name_of(network)?, peered = status.peered_ids.len(), "Updated peering status");
        Ok(())
    }
}

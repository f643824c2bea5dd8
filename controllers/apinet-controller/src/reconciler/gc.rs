//! Garbage collection of allocator leaves and stale NAT claims.
//!
//! `IPAddress` and `NetworkID` leaves point back at their claimer. A leaf
//! whose claimer is gone, or was recreated under a new uid, is deleted.
//! Claimer uids found missing are remembered so the next leaf of the same
//! claimer is collected without a lookup.
//!
//! Deleting a claimer produces no event on its leaves, so the watchers map
//! claimer events onto the leaves through [`network_ids_claimed_by`] and
//! [`ip_addresses_claimed_by`].

use apinet_api::ClaimRef;
use apinet_api::internal::{IP, IPAddress, NATGateway, Network, NetworkID, NetworkInterface};
use apinet_client::error::ignore_not_found;
use apinet_client::{ResourceClient, ResourceObject};
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Reconciler, is_deleting, name_of};
use crate::error::ControllerError;

/// Whether the claimer a leaf points at still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claimer {
    Live,
    Gone,
    Unknown,
}

async fn lookup_claimer<K: ResourceObject>(
    client: &dyn ResourceClient<K>,
    claim_ref: &ClaimRef,
) -> Result<Claimer, ControllerError> {
    let found = client.get_opt(claim_ref.namespace.as_deref(), &claim_ref.name).await?;
    Ok(match found {
        Some(obj) if obj.meta().uid.as_deref() == Some(claim_ref.uid.as_str()) => Claimer::Live,
        _ => Claimer::Gone,
    })
}

/// Leaves whose claim reference carries the uid of `claimer`.
fn leaves_claimed_by<K, C>(leaves: Vec<Arc<K>>, claimer: &C, claim_ref: fn(&K) -> &ClaimRef) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
    C: Resource,
{
    let Some(uid) = claimer.meta().uid.as_deref() else {
        return Vec::new();
    };
    leaves
        .into_iter()
        .filter(|leaf| claim_ref(leaf).uid == uid)
        .map(|leaf| ObjectRef::from_obj(leaf.as_ref()))
        .collect()
}

/// `NetworkID` leaves held by `network`.
pub fn network_ids_claimed_by(ids: Vec<Arc<NetworkID>>, network: &Network) -> Vec<ObjectRef<NetworkID>> {
    leaves_claimed_by(ids, network, |id| &id.spec.claim_ref)
}

/// `IPAddress` leaves held by `ip`.
pub fn ip_addresses_claimed_by(addresses: Vec<Arc<IPAddress>>, ip: &IP) -> Vec<ObjectRef<IPAddress>> {
    leaves_claimed_by(addresses, ip, |address| &address.spec.claim_ref)
}

/// Interfaces holding a NAT claim of `gateway`.
pub fn network_interfaces_claimed_by(
    nics: Vec<Arc<NetworkInterface>>,
    gateway: &NATGateway,
) -> Vec<ObjectRef<NetworkInterface>> {
    let Some(uid) = gateway.metadata.uid.as_deref() else {
        return Vec::new();
    };
    nics.into_iter()
        .filter(|nic| nic.namespace() == gateway.namespace())
        .filter(|nic| nic.spec.nats.iter().any(|nat| nat.claim_ref.uid == uid))
        .map(|nic| ObjectRef::from_obj(nic.as_ref()))
        .collect()
}

impl Reconciler {
    async fn claimer_state(&self, claim_ref: &ClaimRef) -> Result<Claimer, ControllerError> {
        if self.is_absent(&claim_ref.uid) {
            return Ok(Claimer::Gone);
        }
        let resource = (claim_ref.group.as_str(), claim_ref.resource.as_str());
        if resource == (&*IP::group(&()), &*IP::plural(&())) {
            lookup_claimer(self.clients.ips.as_ref(), claim_ref).await
        } else if resource == (&*Network::group(&()), &*Network::plural(&())) {
            lookup_claimer(self.clients.networks.as_ref(), claim_ref).await
        } else {
            Ok(Claimer::Unknown)
        }
    }

    async fn collect_leaf<K: ResourceObject>(
        &self,
        client: &dyn ResourceClient<K>,
        leaf: &K,
        claim_ref: &ClaimRef,
    ) -> Result<Action, ControllerError> {
        let name = name_of(leaf)?;
        if is_deleting(leaf) {
            return Ok(Action::await_change());
        }
        match self.claimer_state(claim_ref).await? {
            Claimer::Live => {}
            Claimer::Unknown => {
                warn!(
                    kind = %K::kind(&()),
                    name,
                    group = %claim_ref.group,
                    resource = %claim_ref.resource,
                    "Leaf claimed by an unknown resource"
                );
            }
            Claimer::Gone => {
                ignore_not_found(client.delete(None, name).await)?;
                self.mark_absent(&claim_ref.uid);
                info!(kind = %K::kind(&()), name, claimer = %claim_ref.name, "Collected orphaned leaf");
            }
        }
        Ok(Action::await_change())
    }

    pub async fn reconcile_ip_address_gc(&self, address: &IPAddress) -> Result<Action, ControllerError> {
        self.collect_leaf(self.clients.ip_addresses.as_ref(), address, &address.spec.claim_ref)
            .await
    }

    pub async fn reconcile_network_id_gc(&self, id: &NetworkID) -> Result<Action, ControllerError> {
        self.collect_leaf(self.clients.network_ids.as_ref(), id, &id.spec.claim_ref)
            .await
    }

    /// Drops NAT claims held by gateways that no longer exist.
    pub async fn reconcile_network_interface_nat_release(
        &self,
        nic: &NetworkInterface,
    ) -> Result<Action, ControllerError> {
        if nic.spec.nats.is_empty() || is_deleting(nic) {
            return Ok(Action::await_change());
        }
        let name = name_of(nic)?;
        let namespace = nic.metadata.namespace.as_deref();

        let mut nats = Vec::with_capacity(nic.spec.nats.len());
        for nat in &nic.spec.nats {
            let gateway = self.clients.nat_gateways.get_opt(namespace, &nat.claim_ref.name).await?;
            let live = gateway.is_some_and(|g| g.metadata.uid.as_deref() == Some(nat.claim_ref.uid.as_str()));
            if live {
                nats.push(nat.clone());
            } else {
                debug!(network_interface = name, nat_gateway = %nat.claim_ref.name, "Dropping stale NAT claim");
            }
        }
        if nats.len() == nic.spec.nats.len() {
            return Ok(Action::await_change());
        }

        let patch = json!({
            "metadata": { "resourceVersion": nic.metadata.resource_version },
            "spec": { "nats": nats },
        });
        self.clients.network_interfaces.patch(namespace, name, &patch).await?;
        info!(network_interface = name, released = nic.spec.nats.len() - nats.len(), "Released stale NAT claims");
        Ok(Action::await_change())
    }
}

//! Network interfaces realised in the internal store.
//!
//! A machine provider creates the internal interface and records its
//! provider ID on the upstream record. From then on the upstream record
//! claims the internal one through its source labels, decides its public
//! IP and routed prefixes, and receives its state, addresses and NAT port
//! blocks back as status.

use apinet_api::internal as apinet;
use apinet_api::labels::SOURCE_UID_LABEL;
use apinet_api::provider_id::{NetworkInterfaceId, parse_network_interface_id};
use apinet_api::upstream::network_interface::{
    NATIPStatus, NetworkInterface, NetworkInterfaceState, NetworkInterfaceStatus,
};
use apinet_api::LocalObjectReference;
use apinet_api::internal::PublicIPRequest;
use apinet_client::{
    ClaimManager, ClaimState, ClaimStrategy, ListSelector, SourceLabelStrategy, add_finalizer, has_finalizer,
    remove_finalizer,
};
use kube::runtime::controller::Action;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Reconciler, is_deleting, name_of, source_ref, uid_of, update_status};
use crate::error::ControllerError;

/// Held while the upstream record claims an internal interface.
pub const NETWORK_INTERFACE_FINALIZER: &str = "apinetlet.apinet.ironcore.dev/networkinterface";

/// Name of the public IP request backing the upstream virtual IP.
pub const VIRTUAL_IP_REQUEST: &str = "virtual-ip";

/// Requeue delay while a referenced virtual IP or prefix is not ready.
pub const PENDING_REQUEUE: Duration = Duration::from_secs(10);

fn status_with_state(state: NetworkInterfaceState) -> NetworkInterfaceStatus {
    NetworkInterfaceStatus {
        state: Some(state),
        ..Default::default()
    }
}

/// Keeps the address of an existing request that asks for the same IP.
fn keep_allocated(mut request: PublicIPRequest, existing: &[PublicIPRequest]) -> PublicIPRequest {
    request.ip = existing
        .iter()
        .find(|e| e.name == request.name && e.ip_family == request.ip_family && e.ip_ref == request.ip_ref)
        .and_then(|e| e.ip);
    request
}

/// Desired spec of the internal interface, and whether a reference is
/// still unresolved.
struct Desired {
    public_ips: Vec<PublicIPRequest>,
    prefixes: Vec<String>,
    pending: bool,
}

impl Reconciler {
    async fn desired_network_interface(
        &self,
        nic: &NetworkInterface,
        internal: &apinet::NetworkInterface,
    ) -> Result<Desired, ControllerError> {
        let namespace = nic.metadata.namespace.as_deref();
        let mut desired = Desired {
            public_ips: Vec::new(),
            prefixes: Vec::new(),
            pending: false,
        };

        if let Some(source) = &nic.spec.virtual_ip {
            if let Some(ephemeral) = &source.ephemeral {
                desired
                    .public_ips
                    .push(PublicIPRequest::ephemeral(VIRTUAL_IP_REQUEST, ephemeral.ip_family));
            } else if let Some(vip_ref) = &source.virtual_ip_ref {
                match self.upstream.virtual_ips.get_opt(namespace, &vip_ref.name).await? {
                    Some(vip) => desired.public_ips.push(PublicIPRequest {
                        ip_ref: Some(LocalObjectReference::new(uid_of(&vip)?)),
                        ..PublicIPRequest::ephemeral(VIRTUAL_IP_REQUEST, vip.spec.ip_family)
                    }),
                    None => {
                        debug!(network_interface = ?nic.metadata.name, virtual_ip = %vip_ref.name, "Virtual IP not found");
                        desired.pending = true;
                    }
                }
            }
        }
        desired.public_ips = desired
            .public_ips
            .into_iter()
            .map(|request| keep_allocated(request, &internal.spec.public_ips))
            .collect();

        for source in &nic.spec.prefixes {
            if let Some(value) = &source.value {
                desired.prefixes.push(value.clone());
            } else if let Some(prefix_ref) = &source.prefix_ref {
                let prefix = self.upstream.prefixes.get_opt(namespace, &prefix_ref.name).await?;
                match prefix.as_ref().and_then(|p| p.allocated_prefix()) {
                    Some(allocated) => desired.prefixes.push(allocated.to_string()),
                    None => {
                        debug!(network_interface = ?nic.metadata.name, prefix = %prefix_ref.name, "Prefix not allocated yet");
                        desired.pending = true;
                    }
                }
            }
        }
        Ok(desired)
    }

    /// NAT port blocks handed to the internal interface `uid`.
    async fn nat_ips(&self, uid: &str) -> Result<Vec<NATIPStatus>, ControllerError> {
        let tables = self
            .apinet
            .nat_tables
            .list(self.apinet_namespace(), &ListSelector::new())
            .await?;
        let mut nat_ips: Vec<NATIPStatus> = tables
            .iter()
            .flat_map(|table| table.spec.ips.iter())
            .flat_map(|nat_ip| {
                nat_ip
                    .sections
                    .iter()
                    .filter(|s| s.target_ref.as_ref().is_some_and(|t| t.uid == uid))
                    .map(|s| NATIPStatus {
                        ip: nat_ip.ip,
                        port: s.port,
                        end_port: s.end_port,
                    })
            })
            .collect();
        nat_ips.sort_by(|a, b| (a.ip, a.port).cmp(&(b.ip, b.port)));
        Ok(nat_ips)
    }

    /// The internal interface named by `id`, if it still has that uid.
    async fn internal_network_interface(
        &self,
        id: &NetworkInterfaceId,
    ) -> Result<Option<apinet::NetworkInterface>, ControllerError> {
        let internal = self
            .apinet
            .network_interfaces
            .get_opt(Some(&id.namespace), &id.name)
            .await?;
        Ok(internal.filter(|n| n.metadata.uid.as_deref() == Some(id.uid.as_str())))
    }

    fn claim_manager<'a>(
        &'a self,
        nic: &NetworkInterface,
        keep: bool,
    ) -> Result<ClaimManager<'a, apinet::NetworkInterface, SourceLabelStrategy>, ControllerError> {
        let strategy = SourceLabelStrategy::new(source_ref(nic)?.labels(), SOURCE_UID_LABEL);
        Ok(ClaimManager::new(self.apinet.network_interfaces.as_ref(), strategy, move |_| keep))
    }

    /// Drops what the upstream record decided on the internal interface
    /// and releases the claim.
    async fn release_network_interface(&self, nic: &NetworkInterface) -> Result<(), ControllerError> {
        let Some(id) = nic
            .spec
            .provider_id
            .as_deref()
            .and_then(|id| parse_network_interface_id(id).ok())
        else {
            return Ok(());
        };
        let Some(internal) = self.internal_network_interface(&id).await? else {
            return Ok(());
        };
        let manager = self.claim_manager(nic, false)?;
        if manager.strategy().claim_state(&internal) != ClaimState::Ours {
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": internal.metadata.resource_version },
            "spec": { "publicIps": [], "prefixes": [] },
        });
        let internal = match self
            .apinet
            .network_interfaces
            .patch(Some(&id.namespace), &id.name, &patch)
            .await
        {
            Ok(updated) => updated,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        manager.claim(vec![internal]).await?;
        info!(network_interface = ?nic.metadata.name, internal = %id.name, "Released internal network interface");
        Ok(())
    }

    pub async fn reconcile_network_interface(&self, nic: &NetworkInterface) -> Result<Action, ControllerError> {
        let name = name_of(nic)?;
        let client = self.upstream.network_interfaces.as_ref();

        if is_deleting(nic) {
            if has_finalizer(nic, NETWORK_INTERFACE_FINALIZER) {
                self.release_network_interface(nic).await?;
                remove_finalizer(client, nic, NETWORK_INTERFACE_FINALIZER).await?;
            }
            return Ok(Action::await_change());
        }

        let Some(provider_id) = nic.spec.provider_id.clone() else {
            update_status(client, nic, nic.status.as_ref(), status_with_state(NetworkInterfaceState::Pending)).await?;
            return Ok(Action::await_change());
        };
        let nic = add_finalizer(client, nic, NETWORK_INTERFACE_FINALIZER).await?;

        let id = match parse_network_interface_id(&provider_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(network_interface = name, error = %e, "Malformed provider ID");
                update_status(client, &nic, nic.status.as_ref(), status_with_state(NetworkInterfaceState::Error)).await?;
                return Ok(Action::await_change());
            }
        };

        let Some(internal) = self.internal_network_interface(&id).await? else {
            debug!(network_interface = name, internal = %id.name, "Internal network interface not found");
            update_status(client, &nic, nic.status.as_ref(), status_with_state(NetworkInterfaceState::Pending)).await?;
            return Ok(Action::await_change());
        };

        let Some(internal) = self.claim_manager(&nic, true)?.claim(vec![internal]).await?.pop() else {
            warn!(network_interface = name, internal = %id.name, "Internal network interface is claimed by another record");
            update_status(client, &nic, nic.status.as_ref(), status_with_state(NetworkInterfaceState::Error)).await?;
            return Ok(Action::await_change());
        };

        let desired = self.desired_network_interface(&nic, &internal).await?;
        let internal = if internal.spec.public_ips == desired.public_ips && internal.spec.prefixes == desired.prefixes {
            internal
        } else {
            let patch = json!({
                "metadata": { "resourceVersion": internal.metadata.resource_version },
                "spec": { "publicIps": desired.public_ips, "prefixes": desired.prefixes },
            });
            let updated = self
                .apinet
                .network_interfaces
                .patch(Some(&id.namespace), &id.name, &patch)
                .await?;
            debug!(network_interface = name, internal = %id.name, "Updated internal public IPs and prefixes");
            updated
        };

        let state = match internal.status.as_ref().and_then(|s| s.state) {
            Some(apinet::NetworkInterfaceState::Ready) => NetworkInterfaceState::Available,
            Some(apinet::NetworkInterfaceState::Error) => NetworkInterfaceState::Error,
            _ => NetworkInterfaceState::Pending,
        };
        let status = NetworkInterfaceStatus {
            state: Some(state),
            ips: internal.spec.ips.clone(),
            prefixes: internal.spec.prefixes.clone(),
            // Only the IPv4 public address is surfaced as the virtual IP.
            virtual_ip: internal
                .spec
                .public_ips
                .iter()
                .filter_map(|p| p.ip)
                .find(IpAddr::is_ipv4),
            nat_ips: self.nat_ips(uid_of(&internal)?).await?,
        };
        update_status(client, &nic, nic.status.as_ref(), status).await?;

        if desired.pending {
            return Ok(Action::requeue(PENDING_REQUEUE));
        }
        Ok(Action::await_change())
    }
}

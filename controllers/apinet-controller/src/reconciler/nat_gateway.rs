//! NAT gateways: public IPs, NAT slot claims and the port-block table.
//!
//! A gateway serves every network interface in its namespace and network
//! that has an address of the gateway's family and no public IP of that
//! family. Each such interface gets one port block on one gateway IP,
//! recorded in the gateway's `NATTable`.

use apinet_api::internal::{
    NATGateway, NATGatewayIP, NATIP, NATIPSection, NATTable, NATTableIPTargetRef, NATTableSpec, NetworkInterface,
};
use apinet_api::labels::APINET_FIELD_OWNER;
use apinet_api::{IPFamily, LocalUidReference};
use apinet_client::error::ignore_not_found;
use apinet_client::{
    ClaimState, ClaimStrategy, ClientError, ListSelector, add_finalizer, has_finalizer, remove_finalizer,
};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use super::nat_allocation::{AllocationManager, PortBlock};
use super::nat_claim::NATClaimStrategy;
use super::{Reconciler, controller_reference, is_deleting, name_of, uid_of};
use crate::config::validate_ports_per_network_interface;
use crate::error::ControllerError;
use crate::events::{actions, reasons};

/// Held while a gateway owns IPs, NAT claims or a table.
pub const NAT_GATEWAY_FINALIZER: &str = "apinet.ironcore.dev/nat-gateway";

/// Address a network interface is translated from.
fn source_ip(nic: &NetworkInterface, family: IPFamily) -> Option<IpAddr> {
    nic.spec.ips.iter().copied().find(|ip| family.contains(ip))
}

/// Whether `nic` should be served by `gateway`.
pub(crate) fn is_nat_candidate(gateway: &NATGateway, nic: &NetworkInterface) -> bool {
    let family = gateway.spec.ip_family;
    nic.spec.network_ref.name == gateway.spec.network_ref.name
        && nic.has_ip_of_family(family)
        && !nic.has_public_ip_of_family(family)
        && !is_deleting(nic)
}

fn nat_strategy(gateway: &NATGateway) -> Result<NATClaimStrategy, ControllerError> {
    Ok(NATClaimStrategy::new(
        gateway.spec.ip_family,
        LocalUidReference::new(name_of(gateway)?, uid_of(gateway)?),
    ))
}

/// Blocks recorded in an existing table, by target uid.
fn recorded_blocks(table: Option<&NATTable>) -> HashMap<String, (PortBlock, IpAddr)> {
    let mut blocks = HashMap::new();
    for nat_ip in table.iter().flat_map(|t| &t.spec.ips) {
        for section in &nat_ip.sections {
            if let Some(target) = &section.target_ref {
                let block = PortBlock {
                    ip: nat_ip.ip,
                    port: section.port,
                    end_port: section.end_port,
                };
                blocks.insert(target.uid.clone(), (block, section.ip));
            }
        }
    }
    blocks
}

impl Reconciler {
    pub async fn reconcile_nat_gateway(&self, gateway: &NATGateway) -> Result<Action, ControllerError> {
        let name = name_of(gateway)?;
        let client = self.clients.nat_gateways.as_ref();

        if is_deleting(gateway) {
            if has_finalizer(gateway, NAT_GATEWAY_FINALIZER) {
                self.delete_nat_gateway(gateway).await?;
                remove_finalizer(client, gateway, NAT_GATEWAY_FINALIZER).await?;
                info!(nat_gateway = name, "Cleaned up NAT gateway");
            }
            return Ok(Action::await_change());
        }

        let ports = match gateway.spec.ports_per_network_interface {
            0 => self.config.default_ports_per_network_interface,
            ports => ports,
        };
        if let Err(e) = validate_ports_per_network_interface(ports) {
            warn!(nat_gateway = name, error = %e, "Invalid NAT gateway");
            self.publish(gateway, EventType::Warning, reasons::INVALID_SPEC, actions::RECONCILE, e.to_string())
                .await;
            return Ok(Action::await_change());
        }

        let gateway = add_finalizer(client, gateway, NAT_GATEWAY_FINALIZER).await?;
        let gateway = self
            .sync_public_ips(client, &gateway, |ips| {
                let ips: Vec<NATGatewayIP> = ips
                    .iter()
                    .map(|req| NATGatewayIP {
                        name: req.name.clone(),
                        ip: req.ip,
                    })
                    .collect();
                json!({ "ips": ips })
            })
            .await?;

        self.allocate_port_blocks(&gateway, ports).await?;
        Ok(Action::await_change())
    }

    async fn delete_nat_gateway(&self, gateway: &NATGateway) -> Result<(), ControllerError> {
        let name = name_of(gateway)?;
        let namespace = gateway.metadata.namespace.as_deref();
        let strategy = nat_strategy(gateway)?;
        let nic_client = self.clients.network_interfaces.as_ref();

        for nic in nic_client.list(namespace, &ListSelector::new()).await? {
            if strategy.claim_state(&nic) != ClaimState::Ours {
                continue;
            }
            match strategy.release(nic_client, &nic).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        ignore_not_found(self.clients.nat_tables.delete(namespace, name).await)?;
        self.allocators.release(gateway).await?;
        Ok(())
    }

    /// Hands out port blocks to every eligible interface and writes the
    /// table and status.
    ///
    /// Interfaces keep the block they already hold as long as their source
    /// address is unchanged. New interfaces are served in name order until
    /// the gateway runs out of blocks.
    async fn allocate_port_blocks(&self, gateway: &NATGateway, ports: i32) -> Result<(), ControllerError> {
        let name = name_of(gateway)?;
        let namespace = gateway.metadata.namespace.as_deref();
        let family = gateway.spec.ip_family;
        let strategy = nat_strategy(gateway)?;
        let nic_client = self.clients.network_interfaces.as_ref();

        let table = self.clients.nat_tables.get_opt(namespace, name).await?;
        let recorded = recorded_blocks(table.as_ref());
        let mut manager = AllocationManager::new(ports, gateway.allocated_ips());

        let mut first_err: Option<ControllerError> = None;
        let mut requested: i64 = 0;
        let mut served: Vec<(NetworkInterface, PortBlock)> = Vec::new();
        let mut fresh: Vec<NetworkInterface> = Vec::new();

        for nic in nic_client.list(namespace, &ListSelector::new()).await? {
            let candidate = is_nat_candidate(gateway, &nic);
            if candidate {
                requested += 1;
            }
            match (strategy.claim_state(&nic), candidate) {
                (ClaimState::Ours, true) => {
                    let previous = nic.metadata.uid.as_ref().and_then(|uid| recorded.get(uid));
                    match previous {
                        Some((block, src)) if Some(*src) == source_ip(&nic, family) && manager.mark_used(block) => {
                            served.push((nic, *block));
                        }
                        _ => fresh.push(nic),
                    }
                }
                (ClaimState::Ours, false) => match strategy.release(nic_client, &nic).await {
                    Ok(_) => debug!(nat_gateway = name, network_interface = ?nic.metadata.name, "Released NAT claim"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        first_err.get_or_insert(e.into());
                    }
                },
                (ClaimState::Unclaimed, true) => fresh.push(nic),
                _ => {}
            }
        }

        fresh.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        for nic in fresh {
            let Some(block) = manager.use_next_free() else {
                debug!(nat_gateway = name, network_interface = ?nic.metadata.name, "No free port block");
                continue;
            };
            if strategy.claim_state(&nic) == ClaimState::Ours {
                served.push((nic, block));
                continue;
            }
            match strategy.adopt(nic_client, &nic).await {
                Ok(adopted) => served.push((adopted, block)),
                Err(e) => {
                    manager.release(&block);
                    if !e.is_not_found() {
                        first_err.get_or_insert(e.into());
                    }
                }
            }
        }

        self.apply_nat_table(gateway, &manager, &served).await?;

        let used = i64::try_from(manager.used()).unwrap_or(i64::MAX);
        let status = gateway.status.clone().unwrap_or_default();
        if status.used_nat_ips != used || status.requested_nat_ips != requested {
            self.clients
                .nat_gateways
                .patch_status(
                    namespace,
                    name,
                    &json!({ "status": { "usedNatIps": used, "requestedNatIps": requested } }),
                )
                .await?;
        }
        debug!(nat_gateway = name, used, requested, capacity = manager.capacity(), "Allocated port blocks");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply_nat_table(
        &self,
        gateway: &NATGateway,
        manager: &AllocationManager,
        served: &[(NetworkInterface, PortBlock)],
    ) -> Result<(), ControllerError> {
        let name = name_of(gateway)?;
        let family = gateway.spec.ip_family;

        let mut ips: Vec<NATIP> = manager
            .ips()
            .iter()
            .map(|ip| NATIP {
                ip: *ip,
                sections: Vec::new(),
            })
            .collect();
        for (nic, block) in served {
            let (Some(src), Some(uid), Some(nic_name)) =
                (source_ip(nic, family), nic.metadata.uid.clone(), nic.metadata.name.clone())
            else {
                continue;
            };
            if let Some(nat_ip) = ips.iter_mut().find(|n| n.ip == block.ip) {
                nat_ip.sections.push(NATIPSection {
                    ip: src,
                    port: block.port,
                    end_port: block.end_port,
                    target_ref: Some(NATTableIPTargetRef {
                        uid,
                        name: nic_name,
                        node_ref: nic.spec.node_ref.clone(),
                    }),
                });
            }
        }
        for nat_ip in &mut ips {
            nat_ip.sections.sort_by_key(|s| s.port);
        }

        let table = NATTable {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: gateway.metadata.namespace.clone(),
                owner_references: Some(vec![controller_reference(gateway)?]),
                ..Default::default()
            },
            spec: NATTableSpec { ips },
        };
        let value = serde_json::to_value(&table).map_err(ClientError::from)?;
        self.clients
            .nat_tables
            .apply(gateway.metadata.namespace.as_deref(), name, &value, APINET_FIELD_OWNER)
            .await?;
        Ok(())
    }
}

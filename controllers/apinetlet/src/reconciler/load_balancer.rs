//! Load balancers and their routing tables.
//!
//! Public load balancers request one ephemeral public IP per family;
//! internal load balancers carry their addresses as given. The upstream
//! routing table of the same name is translated with every destination's
//! provider ID resolved to the internal network interface it names.

use apinet_api::internal as apinet;
use apinet_api::labels::{APINETLET_FIELD_OWNER, dashed_ip};
use apinet_api::provider_id::parse_network_interface_id;
use apinet_api::upstream::load_balancer::{LoadBalancer, LoadBalancerDestination, LoadBalancerStatus};
use apinet_api::{IPFamily, LoadBalancerType, LocalObjectReference};
use apinet_client::{add_finalizer, has_finalizer, remove_finalizer};
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use super::{
    DELETION_REQUEUE, Reconciler, controller_reference, is_deleting, name_of, to_apply, uid_of, update_status,
};
use crate::error::ControllerError;

/// Held until the internal load balancer is gone.
pub const LOAD_BALANCER_FINALIZER: &str = "apinetlet.apinet.ironcore.dev/loadbalancer";

/// Name of the public IP request of `family`.
pub fn public_ip_name(family: IPFamily) -> String {
    family.as_str().to_lowercase()
}

fn desired_ips(lb: &LoadBalancer, existing: &[apinet::PublicIPRequest]) -> Vec<apinet::PublicIPRequest> {
    match lb.spec.type_ {
        LoadBalancerType::Public => lb
            .spec
            .ip_families
            .iter()
            .map(|family| {
                let name = public_ip_name(*family);
                let ip = existing
                    .iter()
                    .find(|e| e.name == name && e.ip_family == *family)
                    .and_then(|e| e.ip);
                apinet::PublicIPRequest {
                    ip,
                    ..apinet::PublicIPRequest::ephemeral(name, *family)
                }
            })
            .collect(),
        LoadBalancerType::Internal => lb
            .spec
            .ips
            .iter()
            .map(|ip| apinet::PublicIPRequest {
                ip: Some(*ip),
                ..apinet::PublicIPRequest::ephemeral(dashed_ip(ip), IPFamily::of(ip))
            })
            .collect(),
    }
}

/// Internal destinations; destinations with a malformed provider ID are
/// dropped.
fn desired_destinations(destinations: &[LoadBalancerDestination]) -> Vec<apinet::LoadBalancerDestination> {
    destinations
        .iter()
        .filter_map(|dest| {
            let target_ref = match &dest.target_ref {
                None => None,
                Some(target) => match parse_network_interface_id(&target.provider_id) {
                    Ok(id) => Some(apinet::LoadBalancerTargetRef {
                        uid: id.uid,
                        name: id.name,
                        node_ref: LocalObjectReference::new(id.node),
                    }),
                    Err(e) => {
                        warn!(ip = %dest.ip, target = %target.name, error = %e, "Dropping routing destination");
                        return None;
                    }
                },
            };
            Some(apinet::LoadBalancerDestination {
                ip: dest.ip,
                target_ref,
            })
        })
        .collect()
}

impl Reconciler {
    pub async fn reconcile_load_balancer(&self, lb: &LoadBalancer) -> Result<Action, ControllerError> {
        let name = name_of(lb)?;
        let namespace = lb.metadata.namespace.as_deref();
        let client = self.upstream.load_balancers.as_ref();
        let apinet_name = uid_of(lb)?.to_string();

        if is_deleting(lb) {
            if !has_finalizer(lb, LOAD_BALANCER_FINALIZER) {
                return Ok(Action::await_change());
            }
            let routing_gone = self
                .delete_translated(self.apinet.load_balancer_routings.as_ref(), &apinet_name)
                .await?;
            let lb_gone = self.delete_translated(self.apinet.load_balancers.as_ref(), &apinet_name).await?;
            if !(routing_gone && lb_gone) {
                debug!(load_balancer = name, "Waiting for internal load balancer to be deleted");
                return Ok(Action::requeue(DELETION_REQUEUE));
            }
            remove_finalizer(client, lb, LOAD_BALANCER_FINALIZER).await?;
            info!(load_balancer = name, "Released load balancer");
            return Ok(Action::await_change());
        }

        let Some(network) = self.resolve_network(namespace, &lb.spec.network_ref.name).await? else {
            debug!(load_balancer = name, network = %lb.spec.network_ref.name, "Network not ready");
            return Ok(Action::await_change());
        };
        let lb = add_finalizer(client, lb, LOAD_BALANCER_FINALIZER).await?;

        let existing = self
            .apinet
            .load_balancers
            .get_opt(self.apinet_namespace(), &apinet_name)
            .await?;
        let existing_ips = existing.map(|e| e.spec.ips).unwrap_or_default();
        let network_ref = LocalObjectReference::new(&network.name);
        let desired = apinet::LoadBalancer {
            metadata: self.translated_meta(&lb)?,
            spec: apinet::LoadBalancerSpec {
                type_: lb.spec.type_,
                network_ref: network_ref.clone(),
                ips: desired_ips(&lb, &existing_ips),
                ports: lb
                    .spec
                    .ports
                    .iter()
                    .map(|p| apinet::LoadBalancerPort {
                        protocol: p.protocol,
                        port: p.port,
                        end_port: p.end_port,
                    })
                    .collect(),
                selector: None,
                template: apinet::InstanceTemplate {
                    metadata: apinet::TemplateMetadata::default(),
                    spec: apinet::InstanceSpec {
                        network_ref,
                        ..Default::default()
                    },
                },
            },
            status: None,
        };
        let internal = self
            .apinet
            .load_balancers
            .apply(self.apinet_namespace(), &apinet_name, &to_apply(&desired)?, APINETLET_FIELD_OWNER)
            .await?;

        let routing = self.upstream.load_balancer_routings.get_opt(namespace, name).await?;
        let internal_routing = apinet::LoadBalancerRouting {
            metadata: kube::api::ObjectMeta {
                owner_references: Some(vec![controller_reference(&internal)?]),
                ..self.translated_meta(&lb)?
            },
            spec: apinet::LoadBalancerRoutingSpec {
                destinations: routing
                    .map(|r| desired_destinations(&r.spec.destinations))
                    .unwrap_or_default(),
            },
        };
        self.apinet
            .load_balancer_routings
            .apply(
                self.apinet_namespace(),
                &apinet_name,
                &to_apply(&internal_routing)?,
                APINETLET_FIELD_OWNER,
            )
            .await?;

        let status = LoadBalancerStatus {
            ips: internal.spec.ips.iter().filter_map(|ip| ip.ip).collect(),
        };
        update_status(client, &lb, lb.status.as_ref(), status).await?;
        Ok(Action::await_change())
    }
}

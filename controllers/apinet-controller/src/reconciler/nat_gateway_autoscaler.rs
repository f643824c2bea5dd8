//! Scales the public IPs of a NAT gateway with the number of interfaces
//! requesting NAT.

use apinet_api::internal::{NATGateway, NATGatewayAutoscaler, NATGatewayIP, slots_per_ip};
use kube::runtime::controller::Action;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::{Reconciler, is_deleting, name_of};
use crate::error::ControllerError;
use crate::names::{RANDOM_SUFFIX_LENGTH, random_suffix};

/// Autoscalers re-evaluate their gateway at least this often.
pub const AUTOSCALER_RESYNC: Duration = Duration::from_secs(60);

/// Number of gateway IPs needed to give `requested` interfaces a port
/// block each, bounded by `min` and `max`.
///
/// A missing minimum means zero, a missing maximum means unbounded. The
/// bounds win over demand.
pub fn desired_public_ips(requested: i64, slots: i64, min: Option<i32>, max: Option<i32>) -> usize {
    let needed = if requested <= 0 || slots <= 0 {
        0
    } else {
        (requested + slots - 1) / slots
    };
    let min = i64::from(min.unwrap_or(0).max(0));
    let mut desired = needed.max(min);
    if let Some(max) = max {
        desired = desired.min(i64::from(max.max(0)));
    }
    usize::try_from(desired).unwrap_or(0)
}

impl Reconciler {
    pub async fn reconcile_nat_gateway_autoscaler(
        &self,
        autoscaler: &NATGatewayAutoscaler,
    ) -> Result<Action, ControllerError> {
        let name = name_of(autoscaler)?;
        if is_deleting(autoscaler) {
            return Ok(Action::await_change());
        }
        let namespace = autoscaler.metadata.namespace.as_deref();
        let gateway_name = autoscaler.spec.nat_gateway_ref.name.as_str();

        let Some(gateway) = self.clients.nat_gateways.get_opt(namespace, gateway_name).await? else {
            debug!(autoscaler = name, nat_gateway = gateway_name, "NAT gateway not found");
            return Ok(Action::requeue(AUTOSCALER_RESYNC));
        };
        if is_deleting(&gateway) {
            return Ok(Action::await_change());
        }

        let ports = match gateway.spec.ports_per_network_interface {
            0 => self.config.default_ports_per_network_interface,
            ports => ports,
        };
        let requested = gateway.status.as_ref().map(|s| s.requested_nat_ips).unwrap_or_default();
        let desired = desired_public_ips(
            requested,
            slots_per_ip(ports),
            autoscaler.spec.min_public_ips,
            autoscaler.spec.max_public_ips,
        );

        let current = gateway.spec.ips.len();
        if desired != current {
            self.scale_gateway(&gateway, desired).await?;
            info!(autoscaler = name, nat_gateway = gateway_name, from = current, to = desired, "Scaled NAT gateway");
        }
        Ok(Action::requeue(AUTOSCALER_RESYNC))
    }

    /// Grows by appending unaddressed IPs, shrinks by dropping the last
    /// ones.
    async fn scale_gateway(&self, gateway: &NATGateway, desired: usize) -> Result<(), ControllerError> {
        let mut ips = gateway.spec.ips.clone();
        if desired < ips.len() {
            ips.truncate(desired);
        } else {
            let mut taken: HashSet<String> = ips.iter().map(|ip| ip.name.clone()).collect();
            while ips.len() < desired {
                let candidate = random_suffix(RANDOM_SUFFIX_LENGTH);
                if taken.insert(candidate.clone()) {
                    ips.push(NATGatewayIP {
                        name: candidate,
                        ip: None,
                    });
                }
            }
        }

        let patch = json!({
            "metadata": { "resourceVersion": gateway.metadata.resource_version },
            "spec": { "ips": ips },
        });
        self.clients
            .nat_gateways
            .patch(gateway.metadata.namespace.as_deref(), name_of(gateway)?, &patch)
            .await?;
        Ok(())
    }
}

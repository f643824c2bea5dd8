//! NAT gateways and the autoscaler sizing their public IPs.

use apinet_api::internal as apinet;
use apinet_api::internal::DEFAULT_PORTS_PER_NETWORK_INTERFACE;
use apinet_api::labels::APINETLET_FIELD_OWNER;
use apinet_api::upstream::nat_gateway::{NATGateway, NATGatewayStatus};
use apinet_api::LocalObjectReference;
use apinet_client::{add_finalizer, has_finalizer, remove_finalizer};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use tracing::{debug, info};

use super::{
    DELETION_REQUEUE, Reconciler, controller_reference, is_deleting, name_of, to_apply, uid_of, update_status,
};
use crate::error::ControllerError;

/// Held until the internal NAT gateway is gone.
pub const NAT_GATEWAY_FINALIZER: &str = "apinetlet.apinet.ironcore.dev/natgateway";

/// Public IPs every translated NAT gateway starts with.
pub const MIN_PUBLIC_IPS: i32 = 1;

impl Reconciler {
    /// Applies the internal NAT gateway and an autoscaler owning its IP
    /// list, then publishes the allocated addresses.
    pub async fn reconcile_nat_gateway(&self, gateway: &NATGateway) -> Result<Action, ControllerError> {
        let name = name_of(gateway)?;
        let namespace = gateway.metadata.namespace.as_deref();
        let client = self.upstream.nat_gateways.as_ref();
        let apinet_name = uid_of(gateway)?.to_string();

        if is_deleting(gateway) {
            if !has_finalizer(gateway, NAT_GATEWAY_FINALIZER) {
                return Ok(Action::await_change());
            }
            let autoscaler_gone = self
                .delete_translated(self.apinet.nat_gateway_autoscalers.as_ref(), &apinet_name)
                .await?;
            let gateway_gone = self.delete_translated(self.apinet.nat_gateways.as_ref(), &apinet_name).await?;
            if !(autoscaler_gone && gateway_gone) {
                debug!(nat_gateway = name, "Waiting for internal NAT gateway to be deleted");
                return Ok(Action::requeue(DELETION_REQUEUE));
            }
            remove_finalizer(client, gateway, NAT_GATEWAY_FINALIZER).await?;
            info!(nat_gateway = name, "Released NAT gateway");
            return Ok(Action::await_change());
        }

        let Some(network) = self.resolve_network(namespace, &gateway.spec.network_ref.name).await? else {
            debug!(nat_gateway = name, network = %gateway.spec.network_ref.name, "Network not ready");
            return Ok(Action::await_change());
        };
        let gateway = add_finalizer(client, gateway, NAT_GATEWAY_FINALIZER).await?;

        let existing = self
            .apinet
            .nat_gateways
            .get_opt(self.apinet_namespace(), &apinet_name)
            .await?;
        let desired = apinet::NATGateway {
            metadata: self.translated_meta(&gateway)?,
            spec: apinet::NATGatewaySpec {
                ip_family: gateway.spec.ip_family,
                network_ref: LocalObjectReference::new(&network.name),
                // The autoscaler owns the IP list.
                ips: existing.map(|e| e.spec.ips).unwrap_or_default(),
                ports_per_network_interface: gateway
                    .spec
                    .ports_per_network_interface
                    .unwrap_or(DEFAULT_PORTS_PER_NETWORK_INTERFACE),
            },
            status: None,
        };
        let internal = self
            .apinet
            .nat_gateways
            .apply(self.apinet_namespace(), &apinet_name, &to_apply(&desired)?, APINETLET_FIELD_OWNER)
            .await?;

        let autoscaler = apinet::NATGatewayAutoscaler {
            metadata: ObjectMeta {
                owner_references: Some(vec![controller_reference(&internal)?]),
                ..self.translated_meta(&gateway)?
            },
            spec: apinet::NATGatewayAutoscalerSpec {
                nat_gateway_ref: LocalObjectReference::new(&apinet_name),
                min_public_ips: Some(MIN_PUBLIC_IPS),
                max_public_ips: Some(self.config.nat_gateway_max_public_ips),
            },
        };
        self.apinet
            .nat_gateway_autoscalers
            .apply(self.apinet_namespace(), &apinet_name, &to_apply(&autoscaler)?, APINETLET_FIELD_OWNER)
            .await?;

        let status = NATGatewayStatus {
            ips: internal.allocated_ips().collect(),
        };
        update_status(client, &gateway, gateway.status.as_ref(), status).await?;
        Ok(Action::await_change())
    }
}

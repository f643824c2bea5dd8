//! Instance scheduler
//!
//! Binds unscheduled instances to nodes. Candidates are filtered by
//! [`filter::feasible_nodes`]; among the survivors the node carrying the
//! fewest instances wins, ties going to the lowest name. The instance is
//! assumed into the [`SchedulerCache`] before its binding is written so
//! consecutive decisions see each other.

pub mod cache;
pub mod filter;
pub mod node_affinity;

pub use cache::{SchedulerCache, Snapshot, instance_key};

use apinet_api::internal::{Instance, Node};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Reconciler, is_deleting, name_of};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::expectations::ControllerKey;

/// Retry interval for instances no node can take.
pub const UNSCHEDULABLE_REQUEUE: Duration = Duration::from_secs(60);

/// Expectation key of the daemon set controlling `instance`, if any.
fn owning_daemon_set(instance: &Instance) -> Option<ControllerKey> {
    let owner = instance
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == "DaemonSet")?;
    Some(ControllerKey::new(
        "DaemonSet",
        instance.metadata.namespace.clone().unwrap_or_default(),
        owner.name.clone(),
    ))
}

impl Reconciler {
    pub async fn reconcile_instance(&self, instance: &Instance) -> Result<Action, ControllerError> {
        let name = name_of(instance)?;
        if instance.spec.node_ref.is_some() || is_deleting(instance) {
            return Ok(Action::await_change());
        }
        let key = instance_key(instance);
        if self.scheduler_cache.is_placed(&key) {
            debug!(instance = %key, "Instance already placed");
            return Ok(Action::await_change());
        }

        let snapshot = self.scheduler_cache.snapshot();
        let chosen = filter::feasible_nodes(instance, &snapshot)
            .into_iter()
            .min_by(|a, b| {
                a.instance_count()
                    .cmp(&b.instance_count())
                    .then_with(|| a.name().cmp(b.name()))
            })
            .map(|n| n.name().to_string());

        let Some(node) = chosen else {
            warn!(instance = %key, nodes = snapshot.nodes().len(), "No node can host instance");
            self.publish(
                instance,
                EventType::Warning,
                reasons::OUT_OF_CAPACITY,
                actions::SCHEDULE,
                format!("0/{} nodes are available", snapshot.nodes().len()),
            )
            .await;
            return Ok(Action::requeue(UNSCHEDULABLE_REQUEUE));
        };

        self.scheduler_cache.assume(instance, &node);
        let patch = json!({
            "metadata": { "resourceVersion": instance.metadata.resource_version },
            "spec": { "nodeRef": { "name": node } },
        });
        match self
            .clients
            .instances
            .patch(instance.metadata.namespace.as_deref(), name, &patch)
            .await
        {
            Ok(bound) => {
                self.scheduler_cache.finish_binding(&bound);
                info!(instance = %key, node = %node, "Scheduled instance");
                self.publish(
                    instance,
                    EventType::Normal,
                    reasons::SCHEDULED,
                    actions::SCHEDULE,
                    format!("Bound to node {node}"),
                )
                .await;
                Ok(Action::await_change())
            }
            Err(e) => {
                self.scheduler_cache.forget(instance);
                self.publish(
                    instance,
                    EventType::Warning,
                    reasons::FAILED_BINDING,
                    actions::SCHEDULE,
                    e.to_string(),
                )
                .await;
                Err(e.into())
            }
        }
    }

    /// Feeds an instance seen on the watch stream to the scheduler cache
    /// and the owning daemon set's expectations.
    pub fn instance_observed(&self, instance: &Instance) {
        self.scheduler_cache.upsert_instance(instance);
        if let (Some(key), Some(name)) = (owning_daemon_set(instance), instance.metadata.name.as_deref()) {
            self.expectations.creation_observed(&key, name);
        }
    }

    pub fn instance_deleted(&self, instance: &Instance) {
        self.scheduler_cache.remove_instance(instance);
        if let (Some(key), Some(name)) = (owning_daemon_set(instance), instance.metadata.name.as_deref()) {
            self.expectations.deletion_observed(&key, name);
        }
    }

    pub fn node_observed(&self, node: Node) {
        self.scheduler_cache.upsert_node(node);
    }

    pub fn node_deleted(&self, node: &Node) {
        if let Some(name) = node.metadata.name.as_deref() {
            self.scheduler_cache.remove_node(name);
        }
    }
}

//! Daemon sets: one instance per eligible node.
//!
//! A node is eligible when it is not being deleted and satisfies the node
//! affinity of the instance template. Instances are matched to nodes by
//! their binding, or before binding by the single-node affinity they were
//! created with. Creates and deletes are gated on expectations so a stale
//! cache never doubles a roll-out; while they are pending the daemon set is
//! polled so a lost observation cannot park it.
//!
//! A create that runs into an existing instance of another revision bumps
//! `collision_count`, which salts the revision hash of the next attempt.

use apinet_api::internal::{Affinity, DaemonSet, DaemonSetStatus, Instance, InstanceTemplate, Node};
use apinet_api::labels::CONTROLLER_REVISION_HASH_LABEL;
use apinet_client::{ClaimManager, ClientError, ListSelector, TargetRefStrategy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::scheduler::node_affinity::matches_node;
use super::{Reconciler, controller_reference, is_deleting, name_of};
use crate::error::ControllerError;
use crate::expectations::ControllerKey;
use crate::names::generate_names;

/// Poll interval while earlier creates and deletes are unobserved.
pub const EXPECTATIONS_REQUEUE: Duration = Duration::from_secs(5);

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(bytes: &[u8], mut hash: u32) -> u32 {
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Revision hash of an instance template, salted with the collision count.
pub fn revision_hash(template: &InstanceTemplate, collision_count: Option<i32>) -> String {
    let encoded = serde_json::to_vec(template).unwrap_or_default();
    let mut hash = fnv1a(&encoded, FNV_OFFSET_BASIS);
    if let Some(count) = collision_count {
        hash = fnv1a(&count.to_be_bytes(), hash);
    }
    format!("{hash:x}")
}

/// Node an instance runs on or is pinned to.
fn target_node(instance: &Instance) -> Option<&str> {
    instance
        .node_name()
        .or_else(|| instance.spec.affinity.as_ref()?.target_node_name())
}

/// Whether `existing`, found under the name of a new instance, belongs to
/// another revision or another owner.
fn is_collision(existing: &Instance, hash: &str, owner_uid: &str) -> bool {
    let same_revision = existing
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CONTROLLER_REVISION_HASH_LABEL))
        .is_some_and(|h| h == hash);
    let same_owner = existing
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true) && r.uid == owner_uid));
    !(same_revision && same_owner)
}

fn labels_of(instance: &Instance) -> BTreeMap<String, String> {
    instance.metadata.labels.clone().unwrap_or_default()
}

fn new_instance(ds: &DaemonSet, name: &str, node: &str, hash: &str, owner: OwnerReference) -> Instance {
    let template = &ds.spec.template;
    let mut labels = template.metadata.labels.clone();
    labels.insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), hash.to_string());

    let mut spec = template.spec.clone();
    spec.affinity = Some(Affinity {
        node_affinity: Affinity::for_node_name(node).node_affinity,
        instance_anti_affinity: spec.affinity.and_then(|a| a.instance_anti_affinity),
    });
    spec.node_ref = None;

    Instance {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: ds.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: (!template.metadata.annotations.is_empty()).then(|| template.metadata.annotations.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec,
    }
}

/// What a daemon set has to change to converge.
#[derive(Debug, Default, PartialEq, Eq)]
struct Plan {
    /// Nodes missing an instance
    create_on: Vec<String>,
    /// Instances to remove
    delete: Vec<String>,
    desired: i32,
    current: i32,
}

/// Matches claimed instances to eligible nodes. Each eligible node keeps
/// its oldest instance; extras, unpinned instances and instances on other
/// nodes are deleted.
fn plan(eligible: &[&Node], instances: &[Instance]) -> Plan {
    let mut by_node: BTreeMap<&str, Vec<&Instance>> = BTreeMap::new();
    let mut plan = Plan::default();
    for instance in instances.iter().filter(|i| !is_deleting(*i)) {
        match target_node(instance) {
            Some(node) => by_node.entry(node).or_default().push(instance),
            None => plan.delete.extend(instance.metadata.name.clone()),
        }
    }

    for node in eligible {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        plan.desired += 1;
        match by_node.remove(name) {
            None => plan.create_on.push(name.to_string()),
            Some(mut group) => {
                plan.current += 1;
                group.sort_by(|a, b| {
                    a.metadata
                        .creation_timestamp
                        .cmp(&b.metadata.creation_timestamp)
                        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
                });
                plan.delete.extend(group.iter().skip(1).filter_map(|i| i.metadata.name.clone()));
            }
        }
    }
    for group in by_node.into_values() {
        plan.delete.extend(group.iter().filter_map(|i| i.metadata.name.clone()));
    }
    plan
}

impl Reconciler {
    pub async fn reconcile_daemon_set(&self, ds: &DaemonSet) -> Result<Action, ControllerError> {
        let name = name_of(ds)?;
        let namespace = ds.metadata.namespace.as_deref();
        let key = ControllerKey::new("DaemonSet", namespace.unwrap_or_default(), name);

        if is_deleting(ds) {
            self.expectations.delete(&key);
            return Ok(Action::await_change());
        }

        let nodes = self.clients.nodes.list(None, &ListSelector::new()).await?;
        let eligible: Vec<&Node> = nodes
            .iter()
            .filter(|n| !is_deleting(*n) && matches_node(ds.spec.template.spec.affinity.as_ref(), n))
            .collect();

        let instances = self.clients.instances.list(namespace, &ListSelector::new()).await?;
        let manager = ClaimManager::new(
            self.clients.instances.as_ref(),
            TargetRefStrategy::new(controller_reference(ds)?),
            |i: &Instance| ds.spec.selector.matches(&labels_of(i)),
        );
        let claimed = manager.claim(instances).await?;
        let claimed = self.propagate_template_ips(ds, claimed).await?;

        let plan = plan(&eligible, &claimed);
        let action = if self.expectations.satisfied(&key) {
            self.manage_instances(ds, &key, &plan).await?;
            Action::await_change()
        } else {
            debug!(daemon_set = name, "Waiting for earlier creates and deletes to be observed");
            Action::requeue(EXPECTATIONS_REQUEUE)
        };

        self.update_daemon_set_status(ds, &plan).await?;
        Ok(action)
    }

    /// Advances the collision count of `ds` past the one it was read with.
    pub(crate) async fn record_collision(&self, ds: &DaemonSet) -> Result<i32, ControllerError> {
        let count = ds.status.as_ref().and_then(|s| s.collision_count).unwrap_or_default() + 1;
        self.clients
            .daemon_sets
            .patch_status(
                ds.metadata.namespace.as_deref(),
                name_of(ds)?,
                &json!({ "status": { "collisionCount": count } }),
            )
            .await?;
        Ok(count)
    }

    /// Instances pick up address changes in place instead of being
    /// recreated.
    async fn propagate_template_ips(&self, ds: &DaemonSet, claimed: Vec<Instance>) -> Result<Vec<Instance>, ControllerError> {
        let ips = &ds.spec.template.spec.ips;
        let mut out = Vec::with_capacity(claimed.len());
        for instance in claimed {
            if is_deleting(&instance) || instance.spec.ips == *ips {
                out.push(instance);
                continue;
            }
            let patch = json!({
                "metadata": { "resourceVersion": instance.metadata.resource_version },
                "spec": { "ips": ips },
            });
            match self
                .clients
                .instances
                .patch(instance.metadata.namespace.as_deref(), name_of(&instance)?, &patch)
                .await
            {
                Ok(updated) => out.push(updated),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn manage_instances(&self, ds: &DaemonSet, key: &ControllerKey, plan: &Plan) -> Result<(), ControllerError> {
        if plan.create_on.is_empty() && plan.delete.is_empty() {
            return Ok(());
        }
        let name = name_of(ds)?;
        let namespace = ds.metadata.namespace.as_deref();
        let names = generate_names(name, plan.create_on.len());
        self.expectations
            .expect_creates_and_deletes(key, names.clone(), plan.delete.clone());

        let hash = revision_hash(&ds.spec.template, ds.status.as_ref().and_then(|s| s.collision_count));
        let owner = controller_reference(ds)?;
        let mut first_err: Option<ControllerError> = None;
        let mut collided = false;

        for (node, instance_name) in plan.create_on.iter().zip(&names) {
            let instance = new_instance(ds, instance_name, node, &hash, owner.clone());
            match self.clients.instances.create(namespace, &instance).await {
                Ok(_) => info!(daemon_set = name, instance = %instance_name, node = %node, "Created instance"),
                Err(ClientError::AlreadyExists(_)) => {
                    self.expectations.creation_observed(key, instance_name);
                    let existing = self.clients.instances.get_opt(namespace, instance_name).await?;
                    if existing.is_some_and(|e| is_collision(&e, &hash, &owner.uid)) {
                        collided = true;
                    }
                    first_err.get_or_insert(ControllerError::Conflict(format!("instance {instance_name} already exists")));
                }
                Err(e) => {
                    self.expectations.creation_observed(key, instance_name);
                    error!(daemon_set = name, node = %node, error = %e, "Failed to create instance");
                    first_err.get_or_insert(e.into());
                }
            }
        }

        for instance_name in &plan.delete {
            match self.clients.instances.delete(namespace, instance_name).await {
                Ok(()) => info!(daemon_set = name, instance = %instance_name, "Deleted instance"),
                Err(e) => {
                    self.expectations.deletion_observed(key, instance_name);
                    if !e.is_not_found() {
                        error!(daemon_set = name, instance = %instance_name, error = %e, "Failed to delete instance");
                        first_err.get_or_insert(e.into());
                    }
                }
            }
        }

        if collided {
            let count = self.record_collision(ds).await?;
            warn!(daemon_set = name, collision_count = count, "Instance name collision");
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn update_daemon_set_status(&self, ds: &DaemonSet, plan: &Plan) -> Result<(), ControllerError> {
        let current = ds.status.clone().unwrap_or_default();
        let status = DaemonSetStatus {
            collision_count: current.collision_count,
            desired_number_scheduled: plan.desired,
            current_number_scheduled: plan.current,
        };
        if status == current {
            return Ok(());
        }
        self.clients
            .daemon_sets
            .patch_status(
                ds.metadata.namespace.as_deref(),
                name_of(ds)?,
                &json!({
                    "status": {
                        "desiredNumberScheduled": status.desired_number_scheduled,
                        "currentNumberScheduled": status.current_number_scheduled,
                    }
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apinet_api::internal::{InstanceSpec, NodeSpec};

    #[test]
    fn test_revision_hash_is_stable_and_salted() {
        let template = InstanceTemplate {
            metadata: Default::default(),
            spec: InstanceSpec::default(),
        };
        assert_eq!(revision_hash(&template, None), revision_hash(&template.clone(), None));
        assert_ne!(revision_hash(&template, None), revision_hash(&template, Some(1)));
    }

    #[test]
    fn test_collision_needs_other_revision_or_owner() {
        let owner = OwnerReference {
            uid: "uid-ds".to_string(),
            controller: Some(true),
            ..Default::default()
        };
        let mut existing = Instance::new("ds-abc", InstanceSpec::default());
        existing.metadata.labels = Some(BTreeMap::from([(
            CONTROLLER_REVISION_HASH_LABEL.to_string(),
            "1234".to_string(),
        )]));
        existing.metadata.owner_references = Some(vec![owner]);

        assert!(!is_collision(&existing, "1234", "uid-ds"));
        assert!(is_collision(&existing, "5678", "uid-ds"));
        assert!(is_collision(&existing, "1234", "uid-other"));
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b"", FNV_OFFSET_BASIS), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a", FNV_OFFSET_BASIS), 0xe40c_292c);
    }

    #[test]
    fn test_plan_keeps_one_instance_per_node() {
        let a = Node::new("a", NodeSpec {});
        let b = Node::new("b", NodeSpec {});
        let pinned = |name: &str, node: &str| {
            Instance::new(
                name,
                InstanceSpec {
                    affinity: Some(Affinity::for_node_name(node)),
                    ..Default::default()
                },
            )
        };

        let instances = vec![
            pinned("a-2", "a"),
            pinned("a-1", "a"),
            pinned("gone", "c"),
            Instance::new("unpinned", InstanceSpec::default()),
        ];
        let plan = plan(&[&a, &b], &instances);
        assert_eq!(plan.create_on, vec!["b".to_string()]);
        assert_eq!(plan.desired, 2);
        assert_eq!(plan.current, 1);

        let mut deleted = plan.delete.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["a-2".to_string(), "gone".to_string(), "unpinned".to_string()]);
    }
}

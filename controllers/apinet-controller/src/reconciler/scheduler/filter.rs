//! Feasibility filters
//!
//! A node is feasible for an instance if it passes, in order, node
//! affinity, instance anti-affinity and topology spread. Anti-affinity and
//! spread only consider instances of the same namespace.

use apinet_api::internal::{Instance, UnsatisfiableConstraintAction};
use apinet_api::selector::matches_optional;
use std::collections::BTreeMap;

use super::cache::{NodeInfo, Snapshot, instance_key};
use super::node_affinity::matches_node;

fn labels_of(instance: &Instance) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    instance.metadata.labels.as_ref().unwrap_or(&EMPTY)
}

/// Instances on `node` sharing a namespace with `instance`, excluding it.
fn peers<'a>(instance: &'a Instance, node: &'a NodeInfo) -> impl Iterator<Item = &'a Instance> + 'a {
    let key = instance_key(instance);
    node.instances()
        .filter(move |other| other.metadata.namespace == instance.metadata.namespace && instance_key(other) != key)
}

/// Nodes of `snapshot` that can host `instance`, in snapshot order.
pub fn feasible_nodes<'a>(instance: &Instance, snapshot: &'a Snapshot) -> Vec<&'a NodeInfo> {
    let affine: Vec<&NodeInfo> = snapshot
        .nodes()
        .iter()
        .filter(|n| n.node().is_some_and(|node| matches_node(instance.spec.affinity.as_ref(), node)))
        .collect();

    affine
        .iter()
        .copied()
        .filter(|n| !violates_anti_affinity(instance, n, snapshot))
        .filter(|n| !violates_topology_spread(instance, n, &affine))
        .collect()
}

/// Anti-affinity is symmetric: `instance` may not join a domain holding
/// an instance it repels, nor one holding an instance that repels it.
fn violates_anti_affinity(instance: &Instance, candidate: &NodeInfo, snapshot: &Snapshot) -> bool {
    let own_terms = instance
        .spec
        .affinity
        .as_ref()
        .map(|a| a.anti_affinity_terms())
        .unwrap_or_default();
    for term in own_terms {
        let Some(domain) = candidate.labels().get(&term.topology_key) else {
            continue;
        };
        let repelled = snapshot
            .nodes()
            .iter()
            .filter(|n| n.labels().get(&term.topology_key) == Some(domain))
            .flat_map(|n| peers(instance, n))
            .any(|other| matches_optional(term.label_selector.as_ref(), labels_of(other)));
        if repelled {
            return true;
        }
    }

    for node in snapshot.nodes() {
        for other in peers(instance, node) {
            let terms = other
                .spec
                .affinity
                .as_ref()
                .map(|a| a.anti_affinity_terms())
                .unwrap_or_default();
            for term in terms {
                let (Some(theirs), Some(ours)) = (
                    node.labels().get(&term.topology_key),
                    candidate.labels().get(&term.topology_key),
                ) else {
                    continue;
                };
                if theirs == ours && matches_optional(term.label_selector.as_ref(), labels_of(instance)) {
                    return true;
                }
            }
        }
    }
    false
}

/// Rejects `candidate` if placing the instance there would push the
/// skew of a hard spread constraint beyond its limit. Domains are the
/// topology values of the nodes passing node affinity; nodes without the
/// topology key are not eligible.
fn violates_topology_spread(instance: &Instance, candidate: &NodeInfo, affine: &[&NodeInfo]) -> bool {
    for constraint in &instance.spec.topology_spread_constraints {
        if constraint.when_unsatisfiable != UnsatisfiableConstraintAction::DoNotSchedule {
            continue;
        }
        let Some(domain) = candidate.labels().get(&constraint.topology_key) else {
            return true;
        };

        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for node in affine {
            let Some(value) = node.labels().get(&constraint.topology_key) else {
                continue;
            };
            let matching = peers(instance, node)
                .filter(|other| matches_optional(constraint.label_selector.as_ref(), labels_of(other)))
                .count();
            *counts.entry(value.as_str()).or_default() += i64::try_from(matching).unwrap_or(i64::MAX);
        }

        let min = counts.values().copied().min().unwrap_or_default();
        let own = i64::from(matches_optional(constraint.label_selector.as_ref(), labels_of(instance)));
        let skew = counts.get(domain.as_str()).copied().unwrap_or_default() + own - min;
        if skew > i64::from(constraint.max_skew) {
            return true;
        }
    }
    false
}

//! Scheduler cache
//!
//! In-memory view of which instances sit on which node. It is fed by the
//! node and instance watch streams and by the scheduler itself: an
//! instance is *assumed* onto a node as soon as a node is picked, before
//! the binding write lands, so the next scheduling decision already sees
//! it. Bindings are never undone; an instance moves only by being
//! recreated.

use apinet_api::LocalObjectReference;
use apinet_api::internal::{Instance, Node};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// `namespace/name` of an instance.
pub fn instance_key(instance: &Instance) -> String {
    format!(
        "{}/{}",
        instance.metadata.namespace.as_deref().unwrap_or_default(),
        instance.metadata.name.as_deref().unwrap_or_default()
    )
}

/// A node and the instances placed on it.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: Option<Arc<Node>>,
    name: String,
    instances: BTreeMap<String, Arc<Instance>>,
}

impl NodeInfo {
    fn empty(name: &str) -> Self {
        Self {
            node: None,
            name: name.to_string(),
            instances: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_deref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.node
            .as_ref()
            .and_then(|n| n.metadata.labels.as_ref())
            .unwrap_or(&EMPTY)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values().map(AsRef::as_ref)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

/// Point-in-time copy of the known nodes, in name order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: Vec<NodeInfo>,
}

impl Snapshot {
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, NodeInfo>,
    /// instance key -> node it is placed on
    placements: HashMap<String, String>,
    assumed: HashSet<String>,
}

impl State {
    fn place(&mut self, key: String, node: &str, instance: Instance) {
        if let Some(previous) = self.placements.get(&key).filter(|n| n.as_str() != node).cloned() {
            self.unplace(&key, &previous);
        }
        self.nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeInfo::empty(node))
            .instances
            .insert(key.clone(), Arc::new(instance));
        self.placements.insert(key, node.to_string());
    }

    fn unplace(&mut self, key: &str, node: &str) {
        let drop_node = match self.nodes.get_mut(node) {
            Some(info) => {
                info.instances.remove(key);
                info.node.is_none() && info.instances.is_empty()
            }
            None => false,
        };
        if drop_node {
            self.nodes.remove(node);
        }
        self.placements.remove(key);
    }
}

#[derive(Debug, Default)]
pub struct SchedulerCache {
    state: Mutex<State>,
}

impl SchedulerCache {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or updates a node.
    pub fn upsert_node(&self, node: Node) {
        let Some(name) = node.metadata.name.clone() else {
            return;
        };
        let mut state = self.lock();
        state
            .nodes
            .entry(name.clone())
            .or_insert_with(|| NodeInfo::empty(&name))
            .node = Some(Arc::new(node));
    }

    /// Removes a node. Instances still placed on it keep counting until
    /// they are removed themselves.
    pub fn remove_node(&self, name: &str) {
        let mut state = self.lock();
        let drop_node = match state.nodes.get_mut(name) {
            Some(info) => {
                info.node = None;
                info.instances.is_empty()
            }
            None => false,
        };
        if drop_node {
            state.nodes.remove(name);
        }
    }

    /// Records an instance as observed in the store.
    pub fn upsert_instance(&self, instance: &Instance) {
        let key = instance_key(instance);
        let mut state = self.lock();
        match instance.node_name() {
            Some(node) => {
                state.assumed.remove(&key);
                state.place(key, node, instance.clone());
            }
            None => {
                // Stale view of an instance we already placed.
                if let Some(node) = state.placements.get(&key).cloned() {
                    if let Some(info) = state.nodes.get_mut(&node) {
                        if let Some(placed) = info.instances.get_mut(&key) {
                            let mut updated = instance.clone();
                            updated.spec.node_ref = placed.spec.node_ref.clone();
                            *placed = Arc::new(updated);
                        }
                    }
                }
            }
        }
    }

    pub fn remove_instance(&self, instance: &Instance) {
        let key = instance_key(instance);
        let mut state = self.lock();
        state.assumed.remove(&key);
        if let Some(node) = state.placements.get(&key).cloned() {
            state.unplace(&key, &node);
        }
    }

    /// Places `instance` on `node` ahead of its binding.
    pub fn assume(&self, instance: &Instance, node: &str) {
        let key = instance_key(instance);
        let mut bound = instance.clone();
        bound.spec.node_ref = Some(LocalObjectReference::new(node));
        let mut state = self.lock();
        state.place(key.clone(), node, bound);
        state.assumed.insert(key);
    }

    /// The binding of an assumed instance was written.
    pub fn finish_binding(&self, bound: &Instance) {
        let key = instance_key(bound);
        let mut state = self.lock();
        state.assumed.remove(&key);
        if let Some(node) = bound.node_name() {
            state.place(key, node, bound.clone());
        }
    }

    /// Drops an assumption whose binding failed.
    pub fn forget(&self, instance: &Instance) {
        let key = instance_key(instance);
        let mut state = self.lock();
        if state.assumed.remove(&key) {
            if let Some(node) = state.placements.get(&key).cloned() {
                state.unplace(&key, &node);
            }
        }
    }

    pub fn is_assumed(&self, key: &str) -> bool {
        self.lock().assumed.contains(key)
    }

    /// Whether the instance is bound or assumed somewhere.
    pub fn is_placed(&self, key: &str) -> bool {
        self.lock().placements.contains_key(key)
    }

    /// Copy of the nodes currently known. Nodes that were removed but still
    /// carry instances are left out.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            nodes: state.nodes.values().filter(|n| n.node.is_some()).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apinet_api::internal::{InstanceSpec, NodeSpec};

    fn node(name: &str) -> Node {
        Node::new(name, NodeSpec {})
    }

    fn instance(name: &str, node: Option<&str>) -> Instance {
        let mut instance = Instance::new(
            name,
            InstanceSpec {
                node_ref: node.map(LocalObjectReference::new),
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some("apinet".to_string());
        instance
    }

    fn counts(cache: &SchedulerCache) -> Vec<(String, usize)> {
        cache
            .snapshot()
            .nodes()
            .iter()
            .map(|n| (n.name().to_string(), n.instance_count()))
            .collect()
    }

    #[test]
    fn test_bound_instances_are_counted() {
        let cache = SchedulerCache::default();
        cache.upsert_node(node("a"));
        cache.upsert_node(node("b"));
        cache.upsert_instance(&instance("i1", Some("a")));
        assert_eq!(counts(&cache), vec![("a".to_string(), 1), ("b".to_string(), 0)]);

        cache.remove_instance(&instance("i1", Some("a")));
        assert_eq!(counts(&cache), vec![("a".to_string(), 0), ("b".to_string(), 0)]);
    }

    #[test]
    fn test_assume_then_forget() {
        let cache = SchedulerCache::default();
        cache.upsert_node(node("a"));
        let i1 = instance("i1", None);

        cache.assume(&i1, "a");
        assert!(cache.is_assumed("apinet/i1"));
        assert_eq!(counts(&cache), vec![("a".to_string(), 1)]);

        cache.forget(&i1);
        assert!(!cache.is_placed("apinet/i1"));
        assert_eq!(counts(&cache), vec![("a".to_string(), 0)]);
    }

    #[test]
    fn test_stale_unbound_view_keeps_placement() {
        let cache = SchedulerCache::default();
        cache.upsert_node(node("a"));
        let i1 = instance("i1", None);
        cache.assume(&i1, "a");
        cache.finish_binding(&instance("i1", Some("a")));
        assert!(!cache.is_assumed("apinet/i1"));

        cache.upsert_instance(&i1);
        assert!(cache.is_placed("apinet/i1"));
        assert_eq!(counts(&cache), vec![("a".to_string(), 1)]);
    }

    #[test]
    fn test_removed_node_is_hidden() {
        let cache = SchedulerCache::default();
        cache.upsert_node(node("a"));
        cache.upsert_instance(&instance("i1", Some("a")));
        cache.remove_node("a");
        assert!(counts(&cache).is_empty());
        assert!(cache.is_placed("apinet/i1"));
    }
}

//! Scheduling constraints of instances: node affinity, instance
//! anti-affinity and topology spread.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

/// Node field recognised by node-selector `matchFields`.
pub const NODE_NAME_FIELD: &str = "metadata.name";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Affinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_anti_affinity: Option<InstanceAntiAffinity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    /// Hard requirement; a node must satisfy at least one term
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_during_scheduling_ignored_during_execution: Option<NodeSelector>,
}

/// Union of node selector terms.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

/// Conjunction of label and field requirements.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAntiAffinity {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_during_scheduling_ignored_during_execution: Vec<InstanceAffinityTerm>,
}

/// Instances matching `label_selector` must not share a `topology_key`
/// domain with the instance carrying this term.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAffinityTerm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    pub topology_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpreadConstraint {
    pub max_skew: i32,

    pub topology_key: String,

    #[serde(default)]
    pub when_unsatisfiable: UnsatisfiableConstraintAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum UnsatisfiableConstraintAction {
    #[default]
    DoNotSchedule,
    ScheduleAnyway,
}

impl NodeSelector {
    /// Selector pinning an instance to a single node by name.
    pub fn for_node_name(node: &str) -> Self {
        Self {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Vec::new(),
                match_fields: vec![NodeSelectorRequirement {
                    key: NODE_NAME_FIELD.to_string(),
                    operator: NodeSelectorOperator::In,
                    values: vec![node.to_string()],
                }],
            }],
        }
    }
}

impl Affinity {
    /// Affinity requiring the named node.
    pub fn for_node_name(node: &str) -> Self {
        Self {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector::for_node_name(node)),
            }),
            instance_anti_affinity: None,
        }
    }

    /// Node name from a single-node `metadata.name In [node]` term, if that
    /// is the only requirement.
    pub fn target_node_name(&self) -> Option<&str> {
        let terms = &self
            .node_affinity
            .as_ref()?
            .required_during_scheduling_ignored_during_execution
            .as_ref()?
            .node_selector_terms;
        let [term] = terms.as_slice() else {
            return None;
        };
        let [req] = term.match_fields.as_slice() else {
            return None;
        };
        match (req.key.as_str(), req.operator, req.values.as_slice()) {
            (NODE_NAME_FIELD, NodeSelectorOperator::In, [node]) => Some(node.as_str()),
            _ => None,
        }
    }

    /// Required anti-affinity terms.
    pub fn anti_affinity_terms(&self) -> &[InstanceAffinityTerm] {
        self.instance_anti_affinity
            .as_ref()
            .map(|a| a.required_during_scheduling_ignored_during_execution.as_slice())
            .unwrap_or_default()
    }
}

//! Required node affinity.
//!
//! A node satisfies a selector if it satisfies at least one of its terms;
//! a term holds if all of its label expressions and field requirements
//! hold. A term without requirements matches nothing. Only `metadata.name`
//! is supported as a field, with `In` and `NotIn`.

use apinet_api::internal::{
    Affinity, NODE_NAME_FIELD, Node, NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm,
};
use std::collections::BTreeMap;

/// Whether `node` satisfies the required node affinity of `affinity`.
/// Without a requirement every node matches.
pub fn matches_node(affinity: Option<&Affinity>, node: &Node) -> bool {
    match affinity
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
    {
        None => true,
        Some(selector) => selector_matches(selector, node),
    }
}

pub fn selector_matches(selector: &NodeSelector, node: &Node) -> bool {
    selector.node_selector_terms.iter().any(|term| term_matches(term, node))
}

fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    if term.match_expressions.is_empty() && term.match_fields.is_empty() {
        return false;
    }
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    term.match_expressions.iter().all(|req| label_matches(req, labels))
        && term.match_fields.iter().all(|req| field_matches(req, node))
}

fn label_matches(req: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    match req.operator {
        NodeSelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
        NodeSelectorOperator::NotIn => value.is_none_or(|v| !req.values.contains(v)),
        NodeSelectorOperator::Exists => value.is_some(),
        NodeSelectorOperator::DoesNotExist => value.is_none(),
        NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
            let ([bound], Some(value)) = (req.values.as_slice(), value) else {
                return false;
            };
            let (Ok(bound), Ok(value)) = (bound.parse::<i64>(), value.parse::<i64>()) else {
                return false;
            };
            if req.operator == NodeSelectorOperator::Gt {
                value > bound
            } else {
                value < bound
            }
        }
    }
}

fn field_matches(req: &NodeSelectorRequirement, node: &Node) -> bool {
    if req.key != NODE_NAME_FIELD {
        return false;
    }
    let name = node.metadata.name.as_deref().unwrap_or_default();
    let listed = req.values.iter().any(|v| v == name);
    match req.operator {
        NodeSelectorOperator::In => listed,
        NodeSelectorOperator::NotIn => !listed,
        _ => false,
    }
}

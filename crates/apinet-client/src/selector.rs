//! Equality-based list selectors

use std::collections::BTreeMap;

/// Label equality requirements a listed object must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    labels: BTreeMap<String, String>,
}

impl ListSelector {
    /// Selector matching every object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector requiring all of `labels`.
    pub fn from_labels(labels: BTreeMap<String, String>) -> Self {
        Self { labels }
    }

    /// Adds a `key=value` requirement.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Selector in API query syntax (`a=b,c=d`).
    pub fn to_query(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn test_query_and_match() {
        let sel = ListSelector::new().with_label("b", "2").with_label("a", "1");
        assert_eq!(sel.to_query(), "a=1,b=2");

        assert!(sel.matches(&btreemap! {
            "a".to_string() => "1".to_string(),
            "b".to_string() => "2".to_string(),
            "c".to_string() => "3".to_string(),
        }));
        assert!(!sel.matches(&btreemap! { "a".to_string() => "1".to_string() }));
        assert!(ListSelector::new().matches(&BTreeMap::new()));
    }
}
